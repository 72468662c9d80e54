mod common;

use std::sync::Arc;

use common::fakes::Fixture;
use common::images::{brightened, flat, png, png_bytes, textured};

use metashop::config::ExtractionConfig;
use metashop::error::MetashopError;
use metashop::features::{BriefExtractor, FeatureExtractor};
use metashop::index::{EngineHandle, MatchEngine, MatchParams};
use metashop::protocol::schema::Response;
use metashop::types::{ImageData, QueryOutcome, TrainingEntry};

fn extractor() -> BriefExtractor {
    BriefExtractor::new(&ExtractionConfig::default())
}

fn trained(seeds: &[u64]) -> (Vec<TrainingEntry>, MatchEngine) {
    let extractor = extractor();
    let entries: Vec<TrainingEntry> = seeds
        .iter()
        .enumerate()
        .map(|(n, &seed)| TrainingEntry {
            product_id: n as i64 + 1,
            descriptors: extractor.extract(&png(&textured(160, 8, seed))).unwrap(),
        })
        .collect();
    let engine = MatchEngine::build(&entries, MatchParams::default()).unwrap();
    (entries, engine)
}

#[test]
fn test_textured_image_yields_descriptors() {
    let descriptors = extractor().extract(&png(&textured(160, 8, 1))).unwrap();
    assert!(descriptors.len() >= 20, "only {} descriptors", descriptors.len());
}

#[test]
fn test_extraction_is_deterministic() {
    let image = png(&textured(128, 6, 2));
    assert_eq!(
        extractor().extract(&image).unwrap(),
        extractor().extract(&image).unwrap()
    );
}

#[test]
fn test_flat_image_yields_nothing() {
    assert!(extractor().extract(&png(&flat(128, 90))).unwrap().is_empty());
}

#[test]
fn test_feature_count_is_capped() {
    let capped = BriefExtractor::new(&ExtractionConfig {
        max_features: 10,
        ..ExtractionConfig::default()
    });
    assert_eq!(capped.extract(&png(&textured(160, 8, 3))).unwrap().len(), 10);
}

#[test]
fn test_garbage_bytes_fail_to_decode() {
    let err = extractor()
        .extract(&ImageData::new(b"definitely not an image".to_vec(), "png"))
        .unwrap_err();
    assert!(matches!(err, MetashopError::Image(_)), "got {err:?}");
}

#[test]
fn test_wrong_extension_hint_still_decodes() {
    let data = png_bytes(&textured(96, 8, 4));
    let hinted = extractor().extract(&ImageData::new(data.clone(), "jpg")).unwrap();
    let unhinted = extractor().extract(&ImageData::new(data.clone(), "")).unwrap();
    let exact = extractor().extract(&ImageData::new(data, "png")).unwrap();
    assert_eq!(hinted, exact);
    assert_eq!(unhinted, exact);
}

#[test]
fn test_large_images_are_downscaled() {
    let small = BriefExtractor::new(&ExtractionConfig {
        max_dimension: 120,
        ..ExtractionConfig::default()
    });
    let gray = small.decode(&png(&textured(480, 16, 5))).unwrap();
    assert_eq!(gray.dimensions(), (120, 120));
}

#[test]
fn test_same_image_identifies_its_product() {
    let (_, engine) = trained(&[10, 11, 12, 13]);
    let extractor = extractor();
    for (n, seed) in [10u64, 11, 12, 13].into_iter().enumerate() {
        let query = extractor.extract(&png(&textured(160, 8, seed))).unwrap();
        assert_eq!(
            engine.query(&query).best().map(|c| c.product_id),
            Some(n as i64 + 1),
            "seed {seed}"
        );
    }
}

#[test]
fn test_brightened_photo_still_identifies() {
    let (_, engine) = trained(&[20, 21, 22]);
    let query = extractor()
        .extract(&png(&brightened(&textured(160, 8, 21), 15)))
        .unwrap();
    assert_eq!(engine.query(&query).best().map(|c| c.product_id), Some(2));
}

#[test]
fn test_flat_query_reports_no_descriptors() {
    let (_, engine) = trained(&[30, 31]);
    let query = extractor().extract(&png(&flat(160, 200))).unwrap();
    assert_eq!(engine.query(&query), QueryOutcome::NoDescriptors);
}

#[tokio::test]
async fn test_identify_request_with_real_images() {
    let (_, engine) = trained(&[40, 41]);
    let fixture = Fixture::new(Arc::new(EngineHandle::with_engine(engine)));
    fixture.catalog.add("Mug", "wm-mug", "az-mug", -1.0, -1.0);
    fixture.catalog.add("Plate", "wm-plate", "az-plate", -1.0, -1.0);
    let mut ctx = fixture.context();
    ctx.extractor = Arc::new(extractor());

    let response = ctx
        .identify(vec![
            png(&textured(160, 8, 41)),
            png(&flat(160, 50)),
            ImageData::new(vec![0xde, 0xad], "png"),
            png(&textured(160, 8, 40)),
        ])
        .await;
    let Response::Identify { products } = response else {
        panic!("expected identify response");
    };
    let names: Vec<_> = products.iter().map(|p| p.product_name.as_str()).collect();
    assert_eq!(names, vec!["Plate", "INVALID PRODUCT", "INVALID PRODUCT", "Mug"]);
}
