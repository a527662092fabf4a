//! End-to-end pipeline scenarios over a file-backed store, driven through
//! a deterministic stand-in encoder so no model artifacts are needed.

use disc_matcher::border::Border;
use disc_matcher::encoder::{Embedding, EncoderRegistry, ImageEncoder};
use disc_matcher::store::{DiscFilter, NewDisc, UploadStatus};
use disc_matcher::{Config, Deadline, MatchError, Matcher, Result};
use image::{Rgb, RgbImage, imageops};
use std::sync::Arc;
use tempfile::TempDir;

/// Coarse intensity-grid signature, unit-norm. Identical bytes embed to
/// identical vectors, so exact re-query similarity is 1.0.
struct GridEncoder {
    label: &'static str,
}

impl ImageEncoder for GridEncoder {
    fn name(&self) -> &str {
        self.label
    }
    fn dimension(&self) -> usize {
        192
    }
    fn embed(&self, raster: &RgbImage) -> Result<Embedding> {
        let small = imageops::resize(raster, 8, 8, imageops::FilterType::Triangle);
        let raw: Vec<f32> = small.pixels().flat_map(|p| p.0).map(|v| v as f32 + 1.0).collect();
        Ok(Embedding::from_raw(raw))
    }
}

fn disc_png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(96, 96, |x, y| {
        let dx = x as f32 - 48.0;
        let dy = y as f32 - 48.0;
        if (dx * dx + dy * dy).sqrt() <= 30.0 {
            Rgb([seed, 255 - seed, seed.wrapping_mul(3)])
        } else {
            Rgb([245, 245, 245])
        }
    });
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
    buf
}

fn config_for(tmp: &TempDir) -> Config {
    Config {
        upload_root: tmp.path().join("uploads"),
        store_url: tmp.path().join("store.sqlite").to_string_lossy().into_owned(),
        min_similarity: 0.1,
        ..Config::default()
    }
}

fn matcher_with(tmp: &TempDir, label: &'static str) -> Matcher {
    let registry = EncoderRegistry::with_encoder(Arc::new(GridEncoder { label }));
    Matcher::with_registry(config_for(tmp), registry).unwrap()
}

#[test]
fn registered_disc_is_the_top_match_for_its_own_photo() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");
    let photo = disc_png(40);

    let (disc_id, _) = matcher
        .register(&photo, Some("image/png"), &NewDisc::new("Dana", "dana@example.com"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(disc_id, &Deadline::none()).unwrap();

    let matches = matcher
        .find_matches(&photo, Some("image/png"), Some(5), Some(0.7), None, &Deadline::none())
        .unwrap();
    assert!(matches.len() <= 5);
    assert_eq!(matches[0].disc_id, disc_id);
    assert!(matches[0].similarity >= 0.95, "similarity {}", matches[0].similarity);
    assert_eq!(matches[0].encoder, "clip");
}

#[test]
fn unconfirmed_discs_never_appear_in_results() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    let (confirmed_id, _) = matcher
        .register(&disc_png(70), None, &NewDisc::new("A", "a@x"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(confirmed_id, &Deadline::none()).unwrap();

    let pending_photo = disc_png(180);
    let (pending_id, _) = matcher
        .register(&pending_photo, None, &NewDisc::new("B", "b@x"), None, &Deadline::none())
        .unwrap();
    // No confirm for the second disc.

    let matches = matcher
        .find_matches(&pending_photo, None, Some(5), None, None, &Deadline::none())
        .unwrap();
    assert!(
        matches.iter().all(|m| m.disc_id != pending_id),
        "pending disc leaked into search results"
    );
}

#[test]
fn switching_encoders_isolates_rows_until_reregistered() {
    let tmp = TempDir::new().unwrap();
    let photo = disc_png(120);

    let clip_matcher = matcher_with(&tmp, "clip");
    let (disc_id, _) = clip_matcher
        .register(&photo, None, &NewDisc::new("C", "c@x"), None, &Deadline::none())
        .unwrap();
    clip_matcher.confirm(disc_id, &Deadline::none()).unwrap();
    drop(clip_matcher);

    // Same store, different active encoder: the clip rows are invisible.
    let dino_matcher = matcher_with(&tmp, "dinov2");
    let matches = dino_matcher
        .find_matches(&photo, None, Some(5), None, None, &Deadline::none())
        .unwrap();
    assert!(matches.is_empty(), "cross-encoder rows must not be retrieved");

    // Re-registering the same photo under the new encoder restores it.
    dino_matcher
        .add_image_to_disc(disc_id, &photo, None, &Deadline::none())
        .unwrap();
    let matches = dino_matcher
        .find_matches(&photo, None, Some(5), None, None, &Deadline::none())
        .unwrap();
    assert_eq!(matches[0].disc_id, disc_id);
    assert_eq!(matches[0].encoder, "dinov2");
}

#[test]
fn a_disc_aggregates_to_its_best_image() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    let first = disc_png(20);
    let second = disc_png(230);
    let (disc_id, _) = matcher
        .register(&first, None, &NewDisc::new("D", "d@x"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(disc_id, &Deadline::none()).unwrap();
    let second_image = matcher
        .add_image_to_disc(disc_id, &second, None, &Deadline::none())
        .unwrap();

    let matches = matcher
        .find_matches(&second, None, Some(5), None, None, &Deadline::none())
        .unwrap();
    // One group for the disc, scored by its best image, represented by it.
    assert_eq!(matches.iter().filter(|m| m.disc_id == disc_id).count(), 1);
    assert_eq!(matches[0].disc_id, disc_id);
    assert_eq!(matches[0].representative_image_id, second_image);
    assert!(matches[0].similarity >= 0.95);
}

#[test]
fn low_border_confidence_falls_back_to_the_full_image() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    // A featureless photo: nothing for either detector stage to clear
    // the confidence floor with.
    let img = RgbImage::from_pixel(96, 96, Rgb([130, 140, 135]));
    let mut photo = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut photo), image::ImageFormat::Png).unwrap();

    let (disc_id, image_id) = matcher
        .register(&photo, None, &NewDisc::new("E", "e@x"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(disc_id, &Deadline::none()).unwrap();

    let image = matcher.get_image(image_id).unwrap();
    assert!(image.border.is_none(), "sub-floor detection must not be persisted");
    assert!(image.cropped_path.is_none());

    let matches = matcher
        .find_matches(&photo, None, Some(1), None, None, &Deadline::none())
        .unwrap();
    assert_eq!(matches[0].disc_id, disc_id);
}

#[test]
fn cancelling_a_pending_disc_removes_rows_and_files() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    let (disc_id, image_id) = matcher
        .register(&disc_png(50), None, &NewDisc::new("F", "f@x"), None, &Deadline::none())
        .unwrap();
    let subtree = tmp.path().join("uploads").join(disc_id.to_string());
    assert!(subtree.exists());

    matcher.cancel(disc_id, &Deadline::none()).unwrap();
    assert!(matches!(matcher.get_disc(disc_id), Err(MatchError::UnknownDisc(_))));
    assert!(matches!(matcher.get_image(image_id), Err(MatchError::UnknownImage(_))));
    assert!(!subtree.exists(), "the disc subtree must be removed");

    // Cancelling an identity that no longer exists is a no-op.
    matcher.cancel(disc_id, &Deadline::none()).unwrap();
}

#[test]
fn detected_borders_are_persisted_and_round_trip() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    let (disc_id, image_id) = matcher
        .register(&disc_png(33), None, &NewDisc::new("G", "g@x"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(disc_id, &Deadline::none()).unwrap();

    let image = matcher.get_image(image_id).unwrap();
    let Some(Border::Circle { cx, cy, radius, confidence }) = image.border else {
        panic!("a clean synthetic disc should yield a circle border");
    };
    assert!((cx - 48.0).abs() <= 4.0, "cx {cx}");
    assert!((cy - 48.0).abs() <= 4.0, "cy {cy}");
    assert!((radius - 30.0).abs() <= 4.0, "radius {radius}");
    assert!((0.0..=1.0).contains(&confidence));
    assert!(image.cropped_path.is_some());
}

#[test]
fn similarity_is_always_within_bounds_and_floored() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    for seed in [10u8, 60, 110, 160, 210] {
        let (disc_id, _) = matcher
            .register(&disc_png(seed), None, &NewDisc::new("H", "h@x"), None, &Deadline::none())
            .unwrap();
        matcher.confirm(disc_id, &Deadline::none()).unwrap();
    }

    let matches = matcher
        .find_matches(&disc_png(10), None, Some(10), Some(0.6), None, &Deadline::none())
        .unwrap();
    assert!(!matches.is_empty());
    for m in &matches {
        assert!((0.0..=1.0 + 1e-5).contains(&m.similarity), "similarity {}", m.similarity);
        assert!(m.similarity >= 0.6, "floored at 0.6, got {}", m.similarity);
    }
}

#[test]
fn listing_filters_by_upload_state() {
    let tmp = TempDir::new().unwrap();
    let matcher = matcher_with(&tmp, "clip");

    let (confirmed, _) = matcher
        .register(&disc_png(15), None, &NewDisc::new("I", "i@x"), None, &Deadline::none())
        .unwrap();
    matcher.confirm(confirmed, &Deadline::none()).unwrap();
    let (pending, _) = matcher
        .register(&disc_png(85), None, &NewDisc::new("J", "j@x"), None, &Deadline::none())
        .unwrap();

    let visible = matcher.list_discs(DiscFilter::default()).unwrap();
    assert!(visible.iter().any(|d| d.id == confirmed));
    assert!(visible.iter().all(|d| d.id != pending));

    let pending_list = matcher
        .list_discs(DiscFilter { upload_status: Some(UploadStatus::Pending), ..DiscFilter::default() })
        .unwrap();
    assert!(pending_list.iter().any(|d| d.id == pending));
}
