//! Publisher to subscriber over the stream transport, with synthetic
//! capture and codecs on both ends.

use std::sync::Arc;
use std::time::Duration;

use meetlink_common::protocol::ControlMessage;
use meetlink_engine::config::{EngineConfig, PublisherConfig, SubscriberConfig, TierConfig};
use meetlink_engine::media::synthetic::SyntheticDecoderFactory;
use meetlink_engine::mixer::AudioMixer;
use meetlink_engine::publisher::{MediaBackends, Publisher};
use meetlink_engine::registry::ChannelRegistry;
use meetlink_engine::session::TransportSession;
use meetlink_engine::subscriber::{Subscriber, SubscriberState, SubscriberStatus};
use meetlink_engine::transport::stream::{StreamConnector, StreamListener};
use meetlink_transport::wire::{ChannelName, VideoTier};
use tokio::sync::broadcast::error::RecvError;

const WAIT: Duration = Duration::from_secs(5);

fn publisher_config() -> PublisherConfig {
    PublisherConfig {
        tiers: vec![TierConfig {
            tier: VideoTier::Low,
            width: 320,
            height: 180,
            frame_rate: 50.0,
            bitrate: 150_000,
        }],
        key_frame_interval: 10,
        ..PublisherConfig::default()
    }
}

async fn connected_pair(mixer: Option<AudioMixer>) -> (Publisher, Subscriber) {
    let engine = EngineConfig::default();
    let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();
    let registry = || ChannelRegistry::new(engine.backpressure, engine.fec.policy.clone());

    let publisher = Publisher::new(
        publisher_config(),
        TransportSession::new(Arc::new(StreamConnector::new(addr)), registry(), engine.reconnect),
        MediaBackends::synthetic(),
    );
    let subscriber = Subscriber::new(
        "remote-1",
        SubscriberConfig {
            tier: VideoTier::Low,
            ..SubscriberConfig::default()
        },
        TransportSession::new(Arc::new(listener), registry(), engine.reconnect),
        Arc::new(SyntheticDecoderFactory),
        mixer,
    )
    .with_fec(engine.fec.clone());
    (publisher, subscriber)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_precedes_first_decoded_key_frame() {
    let (publisher, subscriber) = connected_pair(None).await;
    let mut status = subscriber.subscribe();

    let (s, p) = tokio::join!(subscriber.start(), publisher.start());
    s.unwrap();
    p.unwrap();
    assert_eq!(subscriber.state(), SubscriberState::Connected);
    let mut video = subscriber.take_video_output().unwrap();

    let first = tokio::time::timeout(WAIT, video.recv()).await.unwrap().unwrap();
    assert_eq!(first.channel, ChannelName::Camera(VideoTier::Low));
    assert_eq!(first.frame.data.first(), Some(&b'K'));
    assert_eq!((first.frame.width, first.frame.height), (320, 180));

    // The config for the camera channel was applied before anything played.
    let mut config_applied = false;
    while let Ok(event) = status.try_recv() {
        if event == SubscriberStatus::ConfigApplied(ChannelName::Camera(VideoTier::Low)) {
            config_applied = true;
        }
    }
    assert!(config_applied);

    // Later frames keep their publisher timestamps in order.
    let mut last = first.frame.timestamp_us;
    for _ in 0..5 {
        let next = tokio::time::timeout(WAIT, video.recv()).await.unwrap().unwrap();
        assert!(next.frame.timestamp_us > last);
        last = next.frame.timestamp_us;
    }

    let rx = subscriber.stats();
    assert!(rx.frames_decoded > 0);
    assert_eq!(rx.decode_errors, 0);
    assert!(publisher.stats().key_frames > 0);

    publisher.stop().await;
    subscriber.stop().await;
    assert_eq!(subscriber.state(), SubscriberState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_events_reach_the_subscriber() {
    let (publisher, subscriber) = connected_pair(None).await;
    let mut status = subscriber.subscribe();
    let (s, p) = tokio::join!(subscriber.start(), publisher.start());
    s.unwrap();
    p.unwrap();

    publisher.raise_hand().unwrap();
    let remote = tokio::time::timeout(WAIT, async {
        loop {
            match status.recv().await {
                Ok(SubscriberStatus::Remote(message)) => return message,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(e) => panic!("status stream ended: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(remote, ControlMessage::HandRaised);

    publisher.stop().await;
    subscriber.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_audio_advances_the_mixer() {
    let mixer = AudioMixer::new(48_000, 1);
    let (publisher, subscriber) = connected_pair(Some(mixer.clone())).await;
    let (s, p) = tokio::join!(subscriber.start(), publisher.start());
    s.unwrap();
    p.unwrap();

    let heard = tokio::time::timeout(WAIT, async {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if mixer.output(960).samples.iter().any(|s| *s != 0.0) {
                return;
            }
        }
    })
    .await;
    assert!(heard.is_ok(), "no remote audio reached the mixer");
    assert!(mixer.clock_us() > 0);

    publisher.stop().await;
    subscriber.stop().await;
}
