//! Per-connection request loop and request dispatch.
//!
//! [`SessionContext::handle`] turns one request payload into one response and
//! knows nothing about sockets; [`run_session`] drives it over a stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, ImageStore, PriceLookup};
use crate::config::Config;
use crate::error::{MetashopError, Result};
use crate::features::FeatureExtractor;
use crate::index::EngineHandle;
use crate::protocol::frame::{read_frame_timeout, write_frame, FrameRead};
use crate::protocol::schema::{
    decode_request, encode_response, PricePair, ProductEntry, Request, Response,
};
use crate::types::{ImageData, ProductId, QueryOutcome, Retailer, UNKNOWN_PRICE};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.server.idle_timeout(),
            max_frame_bytes: config.server.max_frame_bytes,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Everything a session needs, injected at construction.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Arc<EngineHandle>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub catalog: Arc<dyn Catalog>,
    pub images: Arc<dyn ImageStore>,
    pub prices: Arc<dyn PriceLookup>,
    pub fallback_image: Arc<ImageData>,
    pub settings: SessionSettings,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed or reset the connection.
    Closed,
    TimedOut,
    /// The server asked the session to stop.
    Aborted,
    Failed(String),
}

impl SessionEnd {
    pub fn label(&self) -> &'static str {
        match self {
            SessionEnd::Closed => "closed",
            SessionEnd::TimedOut => "timed_out",
            SessionEnd::Aborted => "aborted",
            SessionEnd::Failed(_) => "failed",
        }
    }
}

enum Step {
    Continue,
    End(SessionEnd),
}

/// Serve one connection until it closes, idles out, fails or is stopped.
/// Requests are handled strictly in arrival order.
pub async fn run_session<S>(
    ctx: &SessionContext,
    mut stream: S,
    peer: SocketAddr,
    mut stop: watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(peer = %peer, "session started");
    loop {
        if *stop.borrow() {
            return SessionEnd::Aborted;
        }
        let step = tokio::select! {
            biased;
            _ = stop.changed() => Step::End(SessionEnd::Aborted),
            step = serve_one(ctx, &mut stream, peer) => step,
        };
        if let Step::End(end) = step {
            return end;
        }
    }
}

async fn serve_one<S>(ctx: &SessionContext, stream: &mut S, peer: SocketAddr) -> Step
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read = read_frame_timeout(
        stream,
        ctx.settings.max_frame_bytes,
        ctx.settings.idle_timeout,
    )
    .await;

    let payload = match read {
        Ok(FrameRead::Frame(payload)) => payload,
        Ok(FrameRead::Closed) => return Step::End(SessionEnd::Closed),
        Ok(FrameRead::TimedOut) => return Step::End(SessionEnd::TimedOut),
        Err(e @ MetashopError::FrameTooLarge { .. }) => {
            warn!(peer = %peer, error = %e, "oversized frame, ending session");
            // The stream cannot be resynchronised; report and hang up.
            let _ = send(stream, &Response::error(e.to_string())).await;
            return Step::End(SessionEnd::Failed(e.to_string()));
        }
        Err(e) => return Step::End(SessionEnd::Failed(e.to_string())),
    };

    let response = ctx.handle(&payload).await;
    match send(stream, &response).await {
        Ok(()) => Step::Continue,
        Err(MetashopError::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            Step::End(SessionEnd::Closed)
        }
        Err(e) => Step::End(SessionEnd::Failed(e.to_string())),
    }
}

async fn send<S>(stream: &mut S, response: &Response) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = encode_response(response)?;
    write_frame(stream, &body).await
}

impl SessionContext {
    /// Decode and dispatch one request. Malformed input becomes an `error`
    /// response; nothing here ends the session.
    pub async fn handle(&self, payload: &[u8]) -> Response {
        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                crate::metrics::MALFORMED_REQUESTS_TOTAL.inc();
                warn!(error = %e, "malformed request");
                return Response::error(e.to_string());
            }
        };

        crate::metrics::REQUESTS_TOTAL
            .with_label_values(&[request.request_type()])
            .inc();

        match request {
            Request::Identify { images } => self.identify(images).await,
            Request::PriceCheck { metashop_ids } => self.price_check(&metashop_ids).await,
            Request::Invalid => {
                warn!("unknown request type");
                Response::error("unknown request type")
            }
        }
    }

    /// One product entry per image, in request order.
    #[instrument(skip_all, fields(images = images.len()))]
    pub async fn identify(&self, images: Vec<ImageData>) -> Response {
        let mut products = Vec::with_capacity(images.len());
        for image in images {
            let ctx = self.clone();
            let started = Instant::now();
            let entry = match tokio::task::spawn_blocking(move || ctx.identify_one(&image)).await
            {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "identify task failed");
                    self.invalid_entry()
                }
            };
            crate::metrics::IDENTIFY_DURATION.observe(started.elapsed().as_secs_f64());
            products.push(entry);
        }
        Response::Identify { products }
    }

    /// Extraction, matching and catalog lookup for one image. Blocking.
    fn identify_one(&self, image: &ImageData) -> ProductEntry {
        let descriptors = match self.extractor.extract(image) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!(error = %e, extension = %image.extension, "could not extract features");
                record_outcome("no_descriptors");
                return self.invalid_entry();
            }
        };

        // The snapshot is pinned for this query only; a publish mid-request
        // affects the next image.
        let Some(engine) = self.engine.current() else {
            record_outcome("no_index");
            return self.invalid_entry();
        };

        let best = match engine.query(&descriptors) {
            QueryOutcome::NoDescriptors => {
                debug!("image produced no descriptors");
                record_outcome("no_descriptors");
                return self.invalid_entry();
            }
            QueryOutcome::Ranked(candidates) => match candidates.first() {
                Some(best) => *best,
                None => {
                    record_outcome("no_match");
                    return self.invalid_entry();
                }
            },
        };
        drop(engine);

        match self.matched_entry(best.product_id) {
            Ok(Some(entry)) => {
                debug!(
                    product_id = best.product_id,
                    votes = best.vote_count,
                    "identified product"
                );
                record_outcome("matched");
                entry
            }
            Ok(None) => {
                warn!(product_id = best.product_id, "matched product missing from catalog");
                record_outcome("no_match");
                self.invalid_entry()
            }
            Err(e) => {
                warn!(product_id = best.product_id, error = %e, "catalog lookup failed");
                record_outcome("no_match");
                self.invalid_entry()
            }
        }
    }

    fn matched_entry(&self, id: ProductId) -> Result<Option<ProductEntry>> {
        let Some(product) = self.catalog.get_product(id)? else {
            return Ok(None);
        };
        let image = match self.images.load(id) {
            Ok(Some(image)) => image,
            Ok(None) => self.fallback_image.as_ref().clone(),
            Err(e) => {
                warn!(product_id = id, error = %e, "canonical image unavailable");
                self.fallback_image.as_ref().clone()
            }
        };
        Ok(Some(ProductEntry {
            product_name: product.name,
            metashop_id: product.id.to_string(),
            walmart_id: product.walmart_sku,
            amazon_id: product.amazon_asin,
            image,
        }))
    }

    fn invalid_entry(&self) -> ProductEntry {
        ProductEntry::invalid(self.fallback_image.as_ref().clone())
    }

    /// One `{walmart, amazon}` pair per id, in request order. Unknown products
    /// and failed lookups report -1.
    #[instrument(skip_all, fields(ids = metashop_ids.len()))]
    pub async fn price_check(&self, metashop_ids: &[String]) -> Response {
        let mut ids = Vec::with_capacity(metashop_ids.len());
        for raw in metashop_ids {
            match raw.trim().parse::<ProductId>() {
                Ok(id) => ids.push(id),
                Err(_) => return Response::error(format!("invalid metashop_id '{raw}'")),
            }
        }

        let catalog = Arc::clone(&self.catalog);
        let lookup_ids = ids.clone();
        let products = match tokio::task::spawn_blocking(move || catalog.get_products(&lookup_ids))
            .await
        {
            Ok(Ok(products)) => products,
            Ok(Err(e)) => {
                warn!(error = %e, "catalog lookup failed during price check");
                vec![None; ids.len()]
            }
            Err(e) => {
                warn!(error = %e, "catalog task failed during price check");
                vec![None; ids.len()]
            }
        };

        let mut prices = vec![PricePair::UNKNOWN; ids.len()];
        for retailer in Retailer::ALL {
            let wanted: Vec<(usize, String)> = products
                .iter()
                .enumerate()
                .filter_map(|(slot, product)| {
                    let external = product.as_ref()?.external_id(retailer);
                    (!external.is_empty()).then(|| (slot, external.to_string()))
                })
                .collect();

            for chunk in wanted.chunks(self.prices.max_batch().max(1)) {
                let external_ids: Vec<String> = chunk.iter().map(|(_, id)| id.clone()).collect();
                let found = match self.prices.lookup_prices(retailer, &external_ids).await {
                    Ok(found) => found,
                    Err(e) => {
                        crate::metrics::PRICE_LOOKUP_FAILURES_TOTAL
                            .with_label_values(&[&retailer.to_string()])
                            .inc();
                        warn!(retailer = %retailer, error = %e, "price lookup failed, reporting unknown");
                        continue;
                    }
                };
                for ((slot, _), price) in chunk.iter().zip(found) {
                    let price = price.unwrap_or(UNKNOWN_PRICE);
                    match retailer {
                        Retailer::Walmart => prices[*slot].walmart = price,
                        Retailer::Amazon => prices[*slot].amazon = price,
                    }
                }
            }
        }

        Response::PriceCheck { prices }
    }
}

fn record_outcome(outcome: &str) {
    crate::metrics::MATCH_OUTCOMES_TOTAL
        .with_label_values(&[outcome])
        .inc();
}
