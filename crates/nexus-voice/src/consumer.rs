//! Consumer manager: turns remote producers into local consumers and keeps
//! them flowing.
//!
//! Every consumer gets a stats monitor: when inbound bytes stop moving for
//! `stall_polls` consecutive samples it tries a pause/resume cycle, then an
//! ICE restart on the owning transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nexus_common::config::ConsumerConfig;
use nexus_common::models::{MediaKind, MediaType, ProducerInfo};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{VoiceError, VoiceResult};
use crate::events::EngineEvent;
use crate::media::{LocalConsumer, MediaTrack, RtpCapabilities, wait_ended};
use crate::signaling::SignalingClient;
use crate::transport::ManagedTransport;

/// What one stats sample says about a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    Flowing,
    /// No new bytes, but not for long enough yet.
    Waiting,
    Stalled,
}

/// Counts consecutive samples without inbound bytes.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: u32,
    last_bytes: u64,
    idle_polls: u32,
}

impl StallDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last_bytes: 0,
            idle_polls: 0,
        }
    }

    /// Feed the cumulative byte counter. Reports `Stalled` once per
    /// `threshold` idle samples, then starts counting again.
    pub fn observe(&mut self, bytes_received: u64) -> StallVerdict {
        let delta = bytes_received.saturating_sub(self.last_bytes);
        self.last_bytes = bytes_received;
        if delta > 0 {
            self.idle_polls = 0;
            return StallVerdict::Flowing;
        }
        self.idle_polls += 1;
        if self.idle_polls >= self.threshold {
            self.idle_polls = 0;
            StallVerdict::Stalled
        } else {
            StallVerdict::Waiting
        }
    }
}

/// Where a consumer's media ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRoute {
    Audio,
    Screen,
    Webcam,
}

impl ConsumerRoute {
    /// Audio always plays; untagged video is treated as a webcam.
    pub fn resolve(kind: MediaKind, media_type: Option<MediaType>) -> Self {
        match (kind, media_type) {
            (MediaKind::Audio, _) => Self::Audio,
            (MediaKind::Video, Some(MediaType::Screen)) => Self::Screen,
            (MediaKind::Video, _) => Self::Webcam,
        }
    }

    pub fn media_type(self) -> Option<MediaType> {
        match self {
            Self::Audio => None,
            Self::Screen => Some(MediaType::Screen),
            Self::Webcam => Some(MediaType::Webcam),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerAppData {
    #[serde(default)]
    media_type: Option<MediaType>,
}

/// A consumer plus the tasks watching it.
pub struct RemoteConsumer {
    consumer: Arc<dyn LocalConsumer>,
    peer_id: String,
    producer_id: String,
    route: ConsumerRoute,
    tasks: CancellationToken,
}

impl RemoteConsumer {
    pub fn id(&self) -> String {
        self.consumer.id()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn route(&self) -> ConsumerRoute {
        self.route
    }

    pub fn track(&self) -> Arc<dyn MediaTrack> {
        self.consumer.track()
    }

    /// Stop the watchers and close the consumer. Errors are logged.
    pub fn close(&self) {
        self.tasks.cancel();
        if let Err(e) = self.consumer.close() {
            warn!(consumer = %self.consumer.id(), error = %e, "Failed to close consumer");
        }
    }
}

/// A remote video track currently shown for a peer.
#[derive(Clone)]
pub struct VideoEntry {
    pub producer_id: String,
    pub consumer_id: String,
    pub track: Arc<dyn MediaTrack>,
}

/// Live consumers keyed by remote producer id, plus the per-peer video views.
#[derive(Default)]
pub struct ConsumerRegistry {
    by_producer: HashMap<String, RemoteConsumer>,
    in_flight: HashSet<String>,
    screens: HashMap<String, VideoEntry>,
    webcams: HashMap<String, VideoEntry>,
}

impl ConsumerRegistry {
    /// Claim a producer for consumption. `false` if it is already consumed or
    /// a consume for it is under way.
    pub fn begin(&mut self, producer_id: &str) -> bool {
        if self.by_producer.contains_key(producer_id) {
            return false;
        }
        self.in_flight.insert(producer_id.to_owned())
    }

    /// Release a claim that did not end in a consumer.
    pub fn abandon(&mut self, producer_id: &str) {
        self.in_flight.remove(producer_id);
    }

    pub fn is_in_flight(&self, producer_id: &str) -> bool {
        self.in_flight.contains(producer_id)
    }

    pub fn insert(&mut self, consumer: RemoteConsumer) -> Option<RemoteConsumer> {
        self.in_flight.remove(&consumer.producer_id);
        self.by_producer.insert(consumer.producer_id.clone(), consumer)
    }

    pub fn len(&self) -> usize {
        self.by_producer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_producer.is_empty()
    }

    /// Remove the consumer of `producer_id` and the video entry it fed.
    pub fn remove_by_producer(&mut self, producer_id: &str) -> Option<(RemoteConsumer, Option<VideoEntry>)> {
        self.in_flight.remove(producer_id);
        let consumer = self.by_producer.remove(producer_id)?;
        let video = consumer.route.media_type().and_then(|media_type| {
            let views = self.views_mut(media_type);
            views
                .get(&consumer.peer_id)
                .is_some_and(|v| v.producer_id == producer_id)
                .then(|| views.remove(&consumer.peer_id))
                .flatten()
        });
        Some((consumer, video))
    }

    /// Remove everything consumed from `peer_id`.
    pub fn remove_for_peer(&mut self, peer_id: &str) -> (Vec<RemoteConsumer>, Vec<VideoEntry>) {
        let ids: Vec<String> = self
            .by_producer
            .values()
            .filter(|c| c.peer_id == peer_id)
            .map(|c| c.producer_id.clone())
            .collect();
        let consumers = ids
            .iter()
            .filter_map(|id| self.by_producer.remove(id))
            .collect();
        let videos = [self.screens.remove(peer_id), self.webcams.remove(peer_id)]
            .into_iter()
            .flatten()
            .collect();
        (consumers, videos)
    }

    fn views_mut(&mut self, media_type: MediaType) -> &mut HashMap<String, VideoEntry> {
        match media_type {
            MediaType::Screen => &mut self.screens,
            _ => &mut self.webcams,
        }
    }

    /// Show a video for a peer. The entry it replaces is returned so the caller
    /// can stop its track.
    pub fn set_video(&mut self, peer_id: &str, media_type: MediaType, entry: VideoEntry) -> Option<VideoEntry> {
        self.views_mut(media_type).insert(peer_id.to_owned(), entry)
    }

    pub fn video(&self, peer_id: &str, media_type: MediaType) -> Option<&VideoEntry> {
        match media_type {
            MediaType::Screen => self.screens.get(peer_id),
            _ => self.webcams.get(peer_id),
        }
    }

    pub fn video_count(&self) -> usize {
        self.screens.len() + self.webcams.len()
    }

    pub fn take_all(&mut self) -> (Vec<RemoteConsumer>, Vec<VideoEntry>) {
        self.in_flight.clear();
        let consumers = self.by_producer.drain().map(|(_, c)| c).collect();
        let videos = self
            .screens
            .drain()
            .chain(self.webcams.drain())
            .map(|(_, v)| v)
            .collect();
        (consumers, videos)
    }
}

/// Creates consumers and their watchers. Cheap to clone.
#[derive(Clone)]
pub struct ConsumerManager {
    client: SignalingClient,
    settings: ConsumerConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    timers: TaskTracker,
}

impl ConsumerManager {
    /// Stats monitors are spawned on `timers`.
    pub(crate) fn new(
        client: SignalingClient,
        settings: ConsumerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
        timers: TaskTracker,
    ) -> Self {
        Self {
            client,
            settings,
            events,
            timers,
        }
    }

    /// Consume `info` on `transport`, resume it and start its watchers.
    ///
    /// Honours `cancel`; a consumer created before cancellation is closed again.
    pub async fn consume(
        &self,
        transport: Arc<ManagedTransport>,
        capabilities: &RtpCapabilities,
        info: &ProducerInfo,
        cancel: &CancellationToken,
    ) -> VoiceResult<RemoteConsumer> {
        let options = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            r = self.client.consume(capabilities, &info.producer_id, transport.id()) => r?,
        };
        let tag = serde_json::from_value::<ConsumerAppData>(options.app_data.clone())
            .unwrap_or_default()
            .media_type
            .or(info.media_type);
        let route = ConsumerRoute::resolve(options.kind, tag);

        let consumer = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            r = transport.consume(options) => r?,
        };
        let remote = RemoteConsumer {
            consumer,
            peer_id: info.producer_socket_id.clone(),
            producer_id: info.producer_id.clone(),
            route,
            tasks: cancel.child_token(),
        };

        let resumed = tokio::select! {
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            r = remote.consumer.resume() => r.map_err(VoiceError::from),
        };
        if let Err(e) = resumed {
            remote.close();
            return Err(e);
        }
        if let Err(e) = self
            .client
            .resume_consumer(&remote.id(), self.settings.resume_timeout())
            .await
        {
            warn!(consumer = %remote.id(), error = %e, "Server-side resume failed; monitor will retry");
        }
        if let Err(e) = self
            .client
            .resume_producer(&remote.producer_id, self.settings.resume_timeout())
            .await
        {
            debug!(producer = %remote.producer_id, error = %e, "Producer resume not acknowledged");
        }

        self.spawn_monitor(&remote, transport);
        self.spawn_ended_watch(&remote);
        info!(
            consumer = %remote.id(),
            producer = %remote.producer_id,
            peer = %remote.peer_id,
            route = ?route,
            "Consuming remote producer"
        );
        Ok(remote)
    }

    fn spawn_monitor(&self, remote: &RemoteConsumer, transport: Arc<ManagedTransport>) {
        let monitor = StatsMonitor {
            consumer: remote.consumer.clone(),
            transport,
            client: self.client.clone(),
            detector: StallDetector::new(self.settings.stall_polls),
            interval: self.settings.stats_interval(),
            resume_timeout: self.settings.resume_timeout(),
            events: self.events.clone(),
        };
        self.timers.spawn(monitor.run(remote.tasks.child_token()));
    }

    fn spawn_ended_watch(&self, remote: &RemoteConsumer) {
        let ended = remote.consumer.track().ended();
        let cancel = remote.tasks.child_token();
        let events = self.events.clone();
        let producer_id = remote.producer_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = wait_ended(ended) => {
                    debug!(producer = %producer_id, "Remote track ended");
                    let _ = events.send(EngineEvent::ConsumerTrackEnded { producer_id });
                }
            }
        });
    }
}

struct StatsMonitor {
    consumer: Arc<dyn LocalConsumer>,
    transport: Arc<ManagedTransport>,
    client: SignalingClient,
    detector: StallDetector,
    interval: Duration,
    resume_timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl StatsMonitor {
    async fn run(mut self, cancel: CancellationToken) {
        let consumer_id = self.consumer.id();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let stats = match self.consumer.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!(consumer = %consumer_id, error = %e, "Stats unavailable");
                    continue;
                }
            };
            if self.detector.observe(stats.bytes_received) != StallVerdict::Stalled {
                continue;
            }

            warn!(consumer = %consumer_id, bytes = stats.bytes_received, "Consumer stalled; recovering");
            let _ = self.events.send(EngineEvent::ConsumerStalled {
                consumer_id: consumer_id.clone(),
            });

            let recovered = tokio::select! {
                _ = cancel.cancelled() => break,
                ok = self.recover(&consumer_id) => ok,
            };
            let consumer_id = consumer_id.clone();
            let _ = self.events.send(if recovered {
                EngineEvent::ConsumerRecovered { consumer_id }
            } else {
                EngineEvent::ConsumerUnrecovered { consumer_id }
            });
        }
        debug!(consumer = %consumer_id, "Stats monitor stopped");
    }

    /// Pause/resume on both ends; fall back to an ICE restart.
    async fn recover(&self, consumer_id: &str) -> bool {
        match self.cycle(consumer_id).await {
            Ok(()) => {
                info!(consumer = %consumer_id, "Consumer resumed after stall");
                return true;
            }
            Err(e) => warn!(consumer = %consumer_id, error = %e, "Pause/resume failed; restarting ICE"),
        }
        match self.transport.restart_ice(&self.client).await {
            Ok(()) => {
                info!(consumer = %consumer_id, transport = %self.transport.id(), "ICE restarted after stall");
                true
            }
            Err(e) => {
                warn!(consumer = %consumer_id, error = %e, "Stall recovery failed");
                false
            }
        }
    }

    async fn cycle(&self, consumer_id: &str) -> VoiceResult<()> {
        self.consumer.pause().await?;
        self.client.pause_consumer(consumer_id).await?;
        self.consumer.resume().await?;
        self.client
            .resume_consumer(consumer_id, self.resume_timeout)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::names;
    use crate::testing::{FakeEngine, FakeSignaling};
    use crate::retry::RetryPolicy;
    use crate::transport::TransportManager;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[test]
    fn detector_reports_once_per_window() {
        let mut detector = StallDetector::new(2);
        assert_eq!(detector.observe(0), StallVerdict::Waiting);
        assert_eq!(detector.observe(0), StallVerdict::Stalled);
        assert_eq!(detector.observe(0), StallVerdict::Waiting);
        assert_eq!(detector.observe(500), StallVerdict::Flowing);
        assert_eq!(detector.observe(500), StallVerdict::Waiting);
        assert_eq!(detector.observe(900), StallVerdict::Flowing);
    }

    #[test]
    fn untagged_video_routes_to_webcam() {
        assert_eq!(ConsumerRoute::resolve(MediaKind::Video, None), ConsumerRoute::Webcam);
        assert_eq!(
            ConsumerRoute::resolve(MediaKind::Video, Some(MediaType::Screen)),
            ConsumerRoute::Screen
        );
        assert_eq!(
            ConsumerRoute::resolve(MediaKind::Audio, Some(MediaType::Screen)),
            ConsumerRoute::Audio
        );
    }

    struct Rig {
        signaling: Arc<FakeSignaling>,
        engine: Arc<FakeEngine>,
        transport: Arc<ManagedTransport>,
        consumers: ConsumerManager,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    async fn rig() -> Rig {
        let signaling = Arc::new(FakeSignaling::default());
        let engine = Arc::new(FakeEngine::default());
        let client = SignalingClient::new(signaling.clone(), Duration::from_secs(1));
        let (tx, events) = mpsc::unbounded_channel();
        let transport = TransportManager::new(
            client.clone(),
            engine.clone(),
            RetryPolicy::new(1, Duration::from_millis(10)),
            tx.clone(),
        )
        .create_receive_transport(&CancellationToken::new())
        .await
        .unwrap();
        let settings = ConsumerConfig {
            stats_interval_ms: 100,
            stall_polls: 2,
            resume_timeout_ms: 50,
            ..ConsumerConfig::default()
        };
        Rig {
            signaling,
            engine,
            transport,
            consumers: ConsumerManager::new(client, settings, tx, TaskTracker::new()),
            events,
        }
    }

    fn producer(id: &str, kind: MediaKind, media_type: Option<MediaType>) -> ProducerInfo {
        ProducerInfo {
            producer_id: id.into(),
            producer_socket_id: "peer-1".into(),
            kind,
            media_type,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consume_resumes_on_both_ends() {
        let rig = rig().await;
        rig.signaling.register_producer("p1", MediaKind::Video, Some(MediaType::Screen));
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({ "codecs": [] }),
                &producer("p1", MediaKind::Video, None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(remote.route(), ConsumerRoute::Screen);
        assert_eq!(remote.peer_id(), "peer-1");
        assert_eq!(rig.signaling.count(names::RESUME_CONSUMER), 1);
        assert_eq!(rig.signaling.count(names::RESUME_PRODUCER), 1);
        assert_eq!(rig.engine.consumers()[0].resumes.load(Ordering::SeqCst), 1);
        remote.close();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_recovers_exactly_once() {
        let mut rig = rig().await;
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({}),
                &producer("p1", MediaKind::Audio, None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let fake = rig.engine.consumers()[0].clone();
        fake.stalled.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fake.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(fake.resumes.load(Ordering::SeqCst), 2);
        assert_eq!(rig.signaling.count(names::PAUSE_CONSUMER), 1);

        fake.stalled.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fake.pauses.load(Ordering::SeqCst), 1);

        let consumer_id = remote.id();
        assert_eq!(
            rig.events.try_recv().unwrap(),
            EngineEvent::ConsumerStalled { consumer_id: consumer_id.clone() }
        );
        assert_eq!(
            rig.events.try_recv().unwrap(),
            EngineEvent::ConsumerRecovered { consumer_id }
        );
        assert!(rig.events.try_recv().is_err());
        remote.close();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resume_falls_back_to_ice_restart() {
        let rig = rig().await;
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({}),
                &producer("p1", MediaKind::Audio, None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let fake = rig.engine.consumers()[0].clone();
        fake.stalled.store(true, Ordering::SeqCst);
        fake.fail_resume.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(rig.signaling.count(names::RESTART_ICE), 1);
        assert_eq!(rig.engine.recv_transport(0).unwrap().ice_restarts.load(Ordering::SeqCst), 1);
        remote.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_stall_is_reported() {
        let mut rig = rig().await;
        rig.signaling.fail(names::RESTART_ICE, "no such transport");
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({}),
                &producer("p1", MediaKind::Audio, None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let fake = rig.engine.consumers()[0].clone();
        fake.stalled.store(true, Ordering::SeqCst);
        fake.fail_resume.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let consumer_id = remote.id();
        assert_eq!(
            rig.events.try_recv().unwrap(),
            EngineEvent::ConsumerStalled { consumer_id: consumer_id.clone() }
        );
        assert_eq!(
            rig.events.try_recv().unwrap(),
            EngineEvent::ConsumerUnrecovered { consumer_id }
        );
        remote.close();
    }

    #[tokio::test(start_paused = true)]
    async fn closing_stops_the_monitor() {
        let mut rig = rig().await;
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({}),
                &producer("p1", MediaKind::Audio, None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let fake = rig.engine.consumers()[0].clone();
        fake.stalled.store(true, Ordering::SeqCst);
        remote.close();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fake.is_closed());
        assert_eq!(fake.pauses.load(Ordering::SeqCst), 0);
        assert!(rig.events.try_recv().is_err(), "no track-ended echo for our own close");
    }

    #[tokio::test(start_paused = true)]
    async fn registry_tracks_claims_and_video_views() {
        let rig = rig().await;
        let mut registry = ConsumerRegistry::default();
        assert!(registry.begin("p1"));
        assert!(!registry.begin("p1"));

        rig.signaling.register_producer("p1", MediaKind::Video, Some(MediaType::Webcam));
        let remote = rig
            .consumers
            .consume(
                rig.transport.clone(),
                &json!({}),
                &producer("p1", MediaKind::Video, Some(MediaType::Webcam)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let entry = VideoEntry {
            producer_id: "p1".into(),
            consumer_id: remote.id(),
            track: remote.track(),
        };
        registry.insert(remote);
        assert!(!registry.is_in_flight("p1"));
        assert!(!registry.begin("p1"));
        assert!(registry.set_video("peer-1", MediaType::Webcam, entry).is_none());

        let (removed, video) = registry.remove_by_producer("p1").unwrap();
        assert_eq!(removed.producer_id(), "p1");
        assert_eq!(video.unwrap().producer_id, "p1");
        assert_eq!(registry.video_count(), 0);
        removed.close();
    }
}
