use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        "metashop_connections_total", "Accepted client connections"
    ).unwrap();
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "metashop_active_sessions", "Client sessions currently being served"
    ).unwrap();
    pub static ref SESSION_ENDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metashop_session_ends_total", "Terminated sessions", &["reason"]
    ).unwrap();
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metashop_requests_total", "Decoded requests", &["request_type"]
    ).unwrap();
    pub static ref MALFORMED_REQUESTS_TOTAL: IntCounter = register_int_counter!(
        "metashop_malformed_requests_total", "Frames that failed to decode as a request"
    ).unwrap();
    pub static ref IDENTIFY_DURATION: Histogram = register_histogram!(
        "metashop_identify_duration_seconds", "Extraction plus matching time per image",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();
    pub static ref MATCH_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metashop_match_outcomes_total", "Per-image identify outcomes", &["outcome"]
    ).unwrap();
    pub static ref REBUILDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metashop_rebuilds_total", "Index rebuilds", &["status"]
    ).unwrap();
    pub static ref PRICE_LOOKUP_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metashop_price_lookup_failures_total", "Failed price lookup batches", &["retailer"]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&CONNECTIONS_TOTAL);
    lazy_static::initialize(&ACTIVE_SESSIONS);
    lazy_static::initialize(&SESSION_ENDS_TOTAL);
    lazy_static::initialize(&REQUESTS_TOTAL);
    lazy_static::initialize(&MALFORMED_REQUESTS_TOTAL);
    lazy_static::initialize(&IDENTIFY_DURATION);
    lazy_static::initialize(&MATCH_OUTCOMES_TOTAL);
    lazy_static::initialize(&REBUILDS_TOTAL);
    lazy_static::initialize(&PRICE_LOOKUP_FAILURES_TOTAL);
}

/// Increments a gauge on creation and decrements it on drop.
pub struct GaugeGuard {
    gauge: &'static IntGauge,
}

impl GaugeGuard {
    pub fn new(gauge: &'static IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
