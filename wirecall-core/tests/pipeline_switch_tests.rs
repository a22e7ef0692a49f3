//! Outbound video source switching through the media pipeline

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{FakeCapture, RecordingSender};
use wirecall_core::{FilterId, MediaKind, MediaPipeline, TrackSource, VideoSender};

async fn pipeline_with_sender() -> (MediaPipeline, Arc<RecordingSender>, Arc<FakeCapture>) {
    let capture = Arc::new(FakeCapture::new());
    let pipeline = MediaPipeline::new(capture.clone());
    pipeline.acquire(MediaKind::Video, None).await.unwrap();

    let sender = Arc::new(RecordingSender::default());
    pipeline
        .set_video_sender(sender.clone() as Arc<dyn VideoSender>)
        .await
        .unwrap();
    (pipeline, sender, capture)
}

#[tokio::test]
async fn full_switch_cycle_swaps_tracks_only() {
    let (pipeline, sender, capture) = pipeline_with_sender().await;
    let mut sources = pipeline.subscribe_source_changes();

    // camera -> filtered -> screen share -> camera
    pipeline.apply_filter(FilterId::new("noir")).await.unwrap();
    assert_eq!(
        pipeline.active_source().await,
        Some(TrackSource::Filtered(FilterId::new("noir")))
    );

    pipeline.start_screen_share().await.unwrap();
    assert_eq!(pipeline.active_source().await, Some(TrackSource::ScreenShare));

    pipeline.stop_screen_share().await.unwrap();
    // Stopping the share restores what was active before it.
    assert_eq!(
        pipeline.active_source().await,
        Some(TrackSource::Filtered(FilterId::new("noir")))
    );

    pipeline.use_camera().await.unwrap();
    assert_eq!(pipeline.active_source().await, Some(TrackSource::Camera));

    assert_eq!(
        sources.recv().await.unwrap(),
        TrackSource::Filtered(FilterId::new("noir"))
    );
    assert_eq!(sources.recv().await.unwrap(), TrackSource::ScreenShare);
    assert_eq!(
        sources.recv().await.unwrap(),
        TrackSource::Filtered(FilterId::new("noir"))
    );
    assert_eq!(sources.recv().await.unwrap(), TrackSource::Camera);

    // Every switch was a plain track replacement on the existing sender.
    let replaced = sender.replaced.lock().clone();
    // initial attach + filtered + screen + filtered + camera
    assert_eq!(replaced.len(), 5);
    assert!(replaced[0].starts_with("cam-"));
    assert!(replaced[1].starts_with("filtered-"));
    assert!(replaced[2].starts_with("screen-"));
    assert!(replaced[3].starts_with("filtered-"));
    assert!(replaced[4].starts_with("cam-"));

    drop(capture);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn natural_screen_share_end_falls_back() {
    let (pipeline, sender, capture) = pipeline_with_sender().await;

    pipeline.apply_filter(FilterId::new("vivid")).await.unwrap();
    pipeline.start_screen_share().await.unwrap();

    // User stops sharing from OS chrome rather than through the app.
    capture.end_screen_share();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pipeline.active_source().await
                == Some(TrackSource::Filtered(FilterId::new("vivid")))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let replaced = sender.replaced.lock().clone();
    assert!(replaced.last().unwrap().starts_with("filtered-"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn filter_selected_mid_share_applies_after() {
    let (pipeline, _sender, capture) = pipeline_with_sender().await;

    pipeline.start_screen_share().await.unwrap();
    // Selecting a filter during the share defers it.
    pipeline.apply_filter(FilterId::new("crt")).await.unwrap();
    assert_eq!(pipeline.active_source().await, Some(TrackSource::ScreenShare));

    pipeline.stop_screen_share().await.unwrap();
    assert_eq!(
        pipeline.active_source().await,
        Some(TrackSource::Filtered(FilterId::new("crt")))
    );

    drop(capture);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn unknown_filter_is_rejected_without_switching() {
    let (pipeline, sender, _capture) = pipeline_with_sender().await;

    let before = sender.replaced.lock().len();
    let err = pipeline
        .apply_filter(FilterId::new("no-such-filter"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no-such-filter"));
    assert_eq!(pipeline.active_source().await, Some(TrackSource::Camera));
    assert_eq!(sender.replaced.lock().len(), before);

    pipeline.shutdown().await;
}
