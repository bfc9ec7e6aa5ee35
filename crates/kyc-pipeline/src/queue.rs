use std::ffi::OsString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kyc_core::SubmissionDraft;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;

/// Current version of the queued message schema.
pub const MESSAGE_SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    MESSAGE_SCHEMA_VERSION
}

/// A submission waiting for enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    #[serde(default = "default_version")]
    pub version: u32,
    pub message_id: Uuid,
    pub user_id: String,
    pub submission: SubmissionDraft,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries that ended in a handler error.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueMessage {
    pub fn new(user_id: impl Into<String>, submission: SubmissionDraft) -> Self {
        Self {
            version: MESSAGE_SCHEMA_VERSION,
            message_id: Uuid::new_v4(),
            user_id: user_id.into(),
            submission,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    fn file_name(&self) -> String {
        format!(
            "{:020}_{}.json",
            self.enqueued_at.timestamp_micros().max(0),
            self.message_id.simple()
        )
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

/// Processes one delivered message. `Ok` acknowledges it; `Err` rejects it.
pub trait MessageHandler: Send + Sync {
    fn handle<'a>(&'a self, message: &'a QueueMessage) -> HandlerFuture<'a>;
}

/// Message counts per queue directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub in_progress: usize,
    pub dead_letter: usize,
}

/// Verified directory layout of an open queue.
///
/// ```text
/// base_dir/
///   pending/                    -- messages waiting for delivery
///   in_progress/<consumer_id>/  -- the message held by one consumer, plus its lease
///   dead_letter/                -- rejected or unreadable messages, with a .error note
/// ```
#[derive(Debug)]
struct Connection {
    pending: PathBuf,
    in_progress: PathBuf,
    dead_letter: PathBuf,
}

impl Connection {
    async fn open(base_dir: &Path) -> Result<Self, PipelineError> {
        let connection = Self {
            pending: base_dir.join("pending"),
            in_progress: base_dir.join("in_progress"),
            dead_letter: base_dir.join("dead_letter"),
        };
        for dir in [
            &connection.pending,
            &connection.in_progress,
            &connection.dead_letter,
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PipelineError::QueueError(format!("cannot open {}: {e}", dir.display()))
            })?;
        }
        Ok(connection)
    }
}

/// A subscriber's claim directory and the heartbeat file that keeps it alive.
#[derive(Debug, Clone)]
struct Lease {
    consumer_id: Uuid,
    dir: PathBuf,
}

impl Lease {
    const FILE: &'static str = "lease";

    /// Create `in_progress/<consumer_id>/` with a fresh lease inside.
    ///
    /// The directory is built under a hidden name and renamed into place, so
    /// other consumers never see it without a lease.
    async fn acquire(in_progress: &Path) -> Result<Self, PipelineError> {
        let consumer_id = Uuid::new_v4();
        let staging = in_progress.join(format!(".{}", consumer_id.simple()));
        tokio::fs::create_dir_all(&staging).await?;
        write_lease(&staging).await?;

        let dir = in_progress.join(consumer_id.simple().to_string());
        tokio::fs::rename(&staging, &dir).await?;
        Ok(Self { consumer_id, dir })
    }

    async fn renew(&self) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_lease(&self.dir).await
    }

    /// Drop the claim directory. Messages still inside are left without a
    /// lease, so the next sweep by any consumer returns them to pending.
    async fn release(&self) {
        if let Err(e) = remove_claim_dir(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Claim directory left behind");
        }
    }
}

/// Remove a claim directory holding nothing but its lease files.
async fn remove_claim_dir(dir: &Path) -> std::io::Result<()> {
    let lease = dir.join(Lease::FILE);
    for path in [lease.with_extension("tmp"), lease] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    match tokio::fs::remove_dir(dir).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn write_lease(dir: &Path) -> Result<(), PipelineError> {
    let path = dir.join(Lease::FILE);
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, Utc::now().to_rfc3339()).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Whether the lease in `dir` is missing, unreadable or older than `ttl`.
async fn lease_expired(dir: &Path, ttl: Duration) -> bool {
    let Ok(content) = tokio::fs::read_to_string(dir.join(Lease::FILE)).await else {
        return true;
    };
    let Ok(renewed) = DateTime::parse_from_rfc3339(content.trim()) else {
        return true;
    };
    (Utc::now() - renewed.with_timezone(&Utc))
        .to_std()
        .is_ok_and(|age| age > ttl)
}

/// A message moved into a consumer's claim directory.
struct Claimed {
    file_name: OsString,
    path: PathBuf,
    raw: String,
}

struct Shared {
    config: QueueConfig,
    connection: Mutex<Option<Arc<Connection>>>,
    notify: Notify,
    metrics: Option<Arc<PipelineMetrics>>,
}

/// Durable work queue backed by a directory of JSON files.
///
/// The directory is opened lazily on first use. Each subscriber receives
/// messages one at a time into its own claim directory; atomic renames
/// between directories keep a message in exactly one place. Several
/// processes may subscribe to the same queue directory.
pub struct WorkQueue {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_metrics(config: QueueConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: QueueConfig, metrics: Option<Arc<PipelineMetrics>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                connection: Mutex::new(None),
                notify: Notify::new(),
                metrics,
            }),
            shutdown,
            consumer: Mutex::new(None),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.shared.config.dir
    }

    /// Open the queue now instead of on first use.
    pub async fn connect(&self) -> Result<(), PipelineError> {
        self.shared.connection().await.map(|_| ())
    }

    /// Persist a message. Returns `false` if it could not be stored even
    /// after reopening the queue once.
    pub async fn enqueue(&self, message: &QueueMessage) -> bool {
        for attempt in 0..2 {
            match self.shared.write_pending(message).await {
                Ok(()) => {
                    tracing::info!(
                        message_id = %message.message_id,
                        user_id = %message.user_id,
                        "Message enqueued"
                    );
                    self.shared.notify.notify_one();
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        attempt,
                        error = %e,
                        "Enqueue failed"
                    );
                    self.shared.disconnect().await;
                }
            }
        }
        tracing::error!(message_id = %message.message_id, "Message could not be enqueued");
        false
    }

    /// Start delivering messages to `handler`, one at a time.
    ///
    /// Messages held by consumers whose lease has expired are returned to
    /// `pending/` first, and again whenever the lease is renewed.
    pub async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), PipelineError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(PipelineError::QueueError("queue already has a subscriber".into()));
        }

        let connection = self.shared.connection().await?;
        let lease = Lease::acquire(&connection.in_progress).await?;
        self.shared.recover_abandoned(&lease).await?;

        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let shared = Arc::clone(&self.shared);
        tracing::info!(
            dir = %self.base_dir().display(),
            consumer_id = %lease.consumer_id,
            "Subscribed to work queue"
        );
        *consumer = Some(tokio::spawn(consume(shared, handler, lease, shutdown)));
        Ok(())
    }

    /// Stop the subscriber after its in-flight message and release the queue.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Queue consumer ended abnormally");
        }
        self.shared.disconnect().await;
        tracing::info!("Work queue closed");
    }

    pub async fn depth(&self) -> Result<QueueDepth, PipelineError> {
        let connection = self.shared.connection().await?;
        Ok(QueueDepth {
            pending: count_json(&connection.pending).await?,
            in_progress: count_claimed(&connection.in_progress).await?,
            dead_letter: count_json(&connection.dead_letter).await?,
        })
    }

    /// Messages currently dead-lettered, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<String>, PipelineError> {
        let connection = self.shared.connection().await?;
        let mut names: Vec<String> = json_files(&connection.dead_letter)
            .await?
            .iter()
            .filter_map(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl Shared {
    async fn connection(&self) -> Result<Arc<Connection>, PipelineError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let connection = Arc::new(Connection::open(&self.config.dir).await?);
        tracing::debug!(dir = %self.config.dir.display(), "Work queue opened");
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn disconnect(&self) {
        self.connection.lock().await.take();
    }

    async fn write_pending(&self, message: &QueueMessage) -> Result<(), PipelineError> {
        let connection = self.connection().await?;
        let path = connection.pending.join(message.file_name());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(message)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Move the oldest pending message into the consumer's claim directory.
    async fn claim_next(&self, lease: &Lease) -> Result<Option<Claimed>, PipelineError> {
        let connection = self.connection().await?;
        let mut files = json_files(&connection.pending).await?;
        files.sort();

        for source in files {
            let Some(file_name) = source.file_name().map(|n| n.to_os_string()) else {
                continue;
            };
            let dest = lease.dir.join(&file_name);
            match tokio::fs::rename(&source, &dest).await {
                Ok(()) => {}
                // Claimed by someone else between listing and rename.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let raw = tokio::fs::read_to_string(&dest).await?;
            return Ok(Some(Claimed {
                file_name,
                path: dest,
                raw,
            }));
        }
        Ok(None)
    }

    async fn deliver(&self, claimed: Claimed, handler: &Arc<dyn MessageHandler>) {
        let message: QueueMessage = match serde_json::from_str(&claimed.raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(
                    file = %claimed.path.display(),
                    error = %e,
                    "Unreadable queue message"
                );
                self.dead_letter(&claimed, &format!("unreadable message: {e}"))
                    .await;
                return;
            }
        };

        if message.version > MESSAGE_SCHEMA_VERSION {
            tracing::error!(
                message_id = %message.message_id,
                version = message.version,
                "Unsupported message version"
            );
            self.dead_letter(
                &claimed,
                &format!("unsupported message version {}", message.version),
            )
            .await;
            return;
        }

        let outcome = {
            let handler = Arc::clone(handler);
            let message = message.clone();
            tokio::spawn(async move { handler.handle(&message).await }).await
        };

        let error = match outcome {
            Ok(Ok(())) => {
                self.ack(&claimed, &message).await;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => format!("handler panicked: {join_error}"),
        };

        let attempts = message.attempts + 1;
        if attempts < self.config.max_attempts {
            tracing::warn!(
                message_id = %message.message_id,
                attempts,
                error = %error,
                "Message rejected, requeueing"
            );
            self.requeue(&claimed, QueueMessage { attempts, ..message })
                .await;
        } else {
            tracing::warn!(
                message_id = %message.message_id,
                attempts,
                error = %error,
                "Message rejected, dead-lettering"
            );
            self.dead_letter(&claimed, &error).await;
        }
    }

    async fn ack(&self, claimed: &Claimed, message: &QueueMessage) {
        match tokio::fs::remove_file(&claimed.path).await {
            Ok(()) => tracing::debug!(message_id = %message.message_id, "Message acknowledged"),
            Err(e) => tracing::error!(
                message_id = %message.message_id,
                error = %e,
                "Failed to remove acknowledged message"
            ),
        }
    }

    async fn requeue(&self, claimed: &Claimed, message: QueueMessage) {
        let result = async {
            self.write_pending(&message).await?;
            tokio::fs::remove_file(&claimed.path).await?;
            Ok::<(), PipelineError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!(message_id = %message.message_id, error = %e, "Requeue failed");
        }
    }

    async fn dead_letter(&self, claimed: &Claimed, reason: &str) {
        let result = async {
            let connection = self.connection().await?;
            let dest = connection.dead_letter.join(&claimed.file_name);
            tokio::fs::write(dest.with_extension("error"), reason).await?;
            tokio::fs::rename(&claimed.path, &dest).await?;
            Ok::<(), PipelineError>(())
        }
        .await;
        match result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_dead_lettered();
                }
            }
            Err(e) => tracing::error!(
                file = %claimed.path.display(),
                error = %e,
                "Dead-lettering failed"
            ),
        }
    }
}

async fn consume(
    shared: Arc<Shared>,
    handler: Arc<dyn MessageHandler>,
    lease: Lease,
    mut shutdown: watch::Receiver<bool>,
) {
    let heartbeat = tokio::spawn(keep_alive(
        Arc::clone(&shared),
        lease.clone(),
        shutdown.clone(),
    ));
    let poll_interval = shared.config.poll_interval();
    loop {
        if *shutdown.borrow() {
            break;
        }
        match shared.claim_next(&lease).await {
            Ok(Some(claimed)) => shared.deliver(claimed, &handler).await,
            Ok(None) => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Queue read failed, reopening");
                shared.disconnect().await;
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    if let Err(e) = heartbeat.await {
        tracing::error!(error = %e, "Lease heartbeat ended abnormally");
    }
    lease.release().await;
    tracing::debug!(consumer_id = %lease.consumer_id, "Queue consumer stopped");
}

/// Renew the lease and sweep up expired peers until shutdown.
async fn keep_alive(shared: Arc<Shared>, lease: Lease, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.lease() / 3);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if let Err(e) = lease.renew().await {
            tracing::warn!(consumer_id = %lease.consumer_id, error = %e, "Lease renewal failed");
        }
        if let Err(e) = shared.recover_abandoned(&lease).await {
            tracing::warn!(error = %e, "Recovery of abandoned messages failed");
        }
    }
}

impl Shared {
    /// Return messages held under expired leases to `pending/`.
    async fn recover_abandoned(&self, own: &Lease) -> Result<usize, PipelineError> {
        let connection = self.connection().await?;
        let ttl = self.config.lease();
        let mut recovered = 0;

        let mut entries = tokio::fs::read_dir(&connection.in_progress).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || dir == own.dir || !entry.file_type().await?.is_dir() {
                continue;
            }
            if !lease_expired(&dir, ttl).await {
                continue;
            }

            for path in json_files(&dir).await? {
                let Some(name) = path.file_name() else {
                    continue;
                };
                match tokio::fs::rename(&path, connection.pending.join(name)).await {
                    Ok(()) => {
                        recovered += 1;
                        tracing::warn!(file = %path.display(), "Returned abandoned message to pending");
                    }
                    // Another consumer recovered it first.
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if let Err(e) = remove_claim_dir(&dir).await {
                tracing::debug!(dir = %dir.display(), error = %e, "Expired claim directory not removed");
            }
        }

        if recovered > 0 {
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

async fn count_json(dir: &Path) -> Result<usize, PipelineError> {
    Ok(json_files(dir).await?.len())
}

/// Messages held across every consumer's claim directory.
async fn count_claimed(in_progress: &Path) -> Result<usize, PipelineError> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(in_progress).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            count += count_json(&entry.path()).await?;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::jane_doe;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::{Semaphore, mpsc};

    fn config(dir: &Path) -> QueueConfig {
        QueueConfig {
            dir: dir.to_path_buf(),
            poll_interval_ms: 20,
            max_attempts: 1,
            lease_ms: 3_000,
        }
    }

    /// Leave `message` in a claim directory whose lease ran out an hour ago.
    fn abandon(base: &Path, message: &QueueMessage) {
        let dir = base.join("in_progress").join(Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let renewed = Utc::now() - chrono::Duration::hours(1);
        std::fs::write(dir.join("lease"), renewed.to_rfc3339()).unwrap();
        std::fs::write(
            dir.join(message.file_name()),
            serde_json::to_string(message).unwrap(),
        )
        .unwrap();
    }

    /// Forwards every delivery to a channel and returns a fixed result.
    struct Recorder {
        tx: mpsc::UnboundedSender<QueueMessage>,
        fail: bool,
    }

    impl MessageHandler for Recorder {
        fn handle<'a>(&'a self, message: &'a QueueMessage) -> HandlerFuture<'a> {
            Box::pin(async move {
                let _ = self.tx.send(message.clone());
                if self.fail {
                    Err(PipelineError::Persistence("store down".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn recorder(fail: bool) -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<QueueMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx, fail }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<QueueMessage>) -> QueueMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open")
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_for_depth(queue: &WorkQueue, check: impl Fn(QueueDepth) -> bool) {
        for _ in 0..250 {
            if check(queue.depth().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue depth not reached");
    }

    #[test]
    fn message_round_trips_with_camel_case_fields() {
        let message = QueueMessage::new("user-1", jane_doe());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["version"], MESSAGE_SCHEMA_VERSION);
        assert_eq!(json["submission"]["fullName"], "Jane Doe");

        let back: QueueMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let mut json = serde_json::to_value(QueueMessage::new("u", jane_doe())).unwrap();
        json.as_object_mut().unwrap().remove("version");
        let message: QueueMessage = serde_json::from_value(json).unwrap();
        assert_eq!(message.version, MESSAGE_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn enqueue_connects_lazily_and_persists() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(&tmp.path().join("q")));

        assert!(queue.enqueue(&QueueMessage::new("user-1", jane_doe())).await);
        assert_eq!(queue.depth().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn enqueue_returns_false_when_queue_cannot_open() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let queue = WorkQueue::new(config(&blocker));

        assert!(!queue.enqueue(&QueueMessage::new("user-1", jane_doe())).await);
        assert!(queue.connect().await.is_err());
    }

    #[tokio::test]
    async fn delivered_message_is_acknowledged() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();

        let message = QueueMessage::new("user-1", jane_doe());
        assert!(queue.enqueue(&message).await);

        let delivered = recv(&mut rx).await;
        assert_eq!(delivered, message);
        wait_for_depth(&queue, |d| d == QueueDepth::default()).await;
        queue.close().await;
    }

    #[tokio::test]
    async fn messages_delivered_in_enqueue_order() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        let mut ids = Vec::new();
        for user in ["a", "b", "c"] {
            let message = QueueMessage::new(user, jane_doe());
            ids.push(message.message_id);
            assert!(queue.enqueue(&message).await);
            // Distinct enqueue timestamps.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();
        for id in ids {
            assert_eq!(recv(&mut rx).await.message_id, id);
        }
        queue.close().await;
    }

    #[tokio::test]
    async fn failed_message_is_dead_lettered_not_redelivered() {
        let tmp = TempDir::new().unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = WorkQueue::with_metrics(config(tmp.path()), metrics.clone());
        let (handler, mut rx) = recorder(true);
        queue.subscribe(handler).await.unwrap();

        assert!(queue.enqueue(&QueueMessage::new("user-1", jane_doe())).await);
        recv(&mut rx).await;

        wait_for_depth(&queue, |d| d.dead_letter == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "message was redelivered");
        assert_eq!(queue.depth().await.unwrap().pending, 0);
        assert_eq!(metrics.snapshot().messages_dead_lettered, 1);

        let names = queue.dead_letters().await.unwrap();
        let note = std::fs::read_to_string(
            tmp.path().join("dead_letter").join(format!("{}.error", names[0])),
        )
        .unwrap();
        assert!(note.contains("store down"));
        queue.close().await;
    }

    #[tokio::test]
    async fn failed_message_retried_up_to_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(QueueConfig {
            max_attempts: 3,
            ..config(tmp.path())
        });
        let (handler, mut rx) = recorder(true);
        queue.subscribe(handler).await.unwrap();

        assert!(queue.enqueue(&QueueMessage::new("user-1", jane_doe())).await);
        let attempts: Vec<u32> = vec![
            recv(&mut rx).await.attempts,
            recv(&mut rx).await.attempts,
            recv(&mut rx).await.attempts,
        ];
        assert_eq!(attempts, vec![0, 1, 2]);

        wait_for_depth(&queue, |d| d.dead_letter == 1).await;
        queue.close().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_delivery() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        queue.connect().await.unwrap();
        std::fs::write(tmp.path().join("pending").join("0_garbage.json"), "{not json").unwrap();

        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();

        wait_for_depth(&queue, |d| d.dead_letter == 1).await;
        assert!(rx.try_recv().is_err());
        queue.close().await;
    }

    #[tokio::test]
    async fn newer_schema_version_is_dead_lettered() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        let mut message = QueueMessage::new("user-1", jane_doe());
        message.version = MESSAGE_SCHEMA_VERSION + 1;
        assert!(queue.enqueue(&message).await);

        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();

        wait_for_depth(&queue, |d| d.dead_letter == 1).await;
        assert!(rx.try_recv().is_err());
        queue.close().await;
    }

    /// Blocks every delivery until a permit is released.
    struct Gated {
        gate: Arc<Semaphore>,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    impl MessageHandler for Gated {
        fn handle<'a>(&'a self, message: &'a QueueMessage) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(message.user_id.clone());
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| PipelineError::QueueError(e.to_string()))?;
                permit.forget();
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn one_message_in_flight_at_a_time() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        let gate = Arc::new(Semaphore::new(0));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        queue
            .subscribe(Arc::new(Gated {
                gate: gate.clone(),
                seen: seen.clone(),
            }))
            .await
            .unwrap();

        assert!(queue.enqueue(&QueueMessage::new("a", jane_doe())).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(queue.enqueue(&QueueMessage::new("b", jane_doe())).await);

        wait_until(|| seen.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(queue.depth().await.unwrap().in_progress, 1);

        gate.add_permits(1);
        wait_until(|| seen.lock().unwrap().len() == 2).await;
        gate.add_permits(1);
        wait_for_depth(&queue, |d| d == QueueDepth::default()).await;
        queue.close().await;
    }

    #[tokio::test]
    async fn interrupted_message_is_redelivered_after_restart() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        queue.connect().await.unwrap();
        let message = QueueMessage::new("user-1", jane_doe());
        abandon(tmp.path(), &message);

        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();
        assert_eq!(recv(&mut rx).await.message_id, message.message_id);
        wait_for_depth(&queue, |d| d == QueueDepth::default()).await;
        queue.close().await;
    }

    #[tokio::test]
    async fn running_consumer_recovers_expired_peer() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(QueueConfig {
            lease_ms: 300,
            ..config(tmp.path())
        });
        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();

        // A peer dies after subscribing.
        let message = QueueMessage::new("user-1", jane_doe());
        abandon(tmp.path(), &message);

        assert_eq!(recv(&mut rx).await.message_id, message.message_id);
        queue.close().await;
    }

    #[tokio::test]
    async fn consumers_sharing_a_directory_do_not_steal_claims() {
        let tmp = TempDir::new().unwrap();
        let first = WorkQueue::new(config(tmp.path()));
        let gate = Arc::new(Semaphore::new(0));
        let first_seen = Arc::new(StdMutex::new(Vec::new()));
        first
            .subscribe(Arc::new(Gated {
                gate: gate.clone(),
                seen: first_seen.clone(),
            }))
            .await
            .unwrap();

        assert!(first.enqueue(&QueueMessage::new("held", jane_doe())).await);
        wait_until(|| first_seen.lock().unwrap().len() == 1).await;

        let second = WorkQueue::new(config(tmp.path()));
        let (handler, mut rx) = recorder(false);
        second.subscribe(handler).await.unwrap();

        // The second consumer takes new work but not the held message.
        assert!(second.enqueue(&QueueMessage::new("fresh", jane_doe())).await);
        assert_eq!(recv(&mut rx).await.user_id, "fresh");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err(), "held message delivered twice");
        assert_eq!(first.depth().await.unwrap().in_progress, 1);

        gate.add_permits(1);
        wait_for_depth(&first, |d| d == QueueDepth::default()).await;
        assert_eq!(*first_seen.lock().unwrap(), vec!["held".to_string()]);

        first.close().await;
        second.close().await;
        assert!(
            std::fs::read_dir(tmp.path().join("in_progress"))
                .unwrap()
                .next()
                .is_none(),
            "claim directories left behind"
        );
    }

    #[tokio::test]
    async fn second_subscriber_is_refused() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        queue.subscribe(recorder(false).0).await.unwrap();
        assert!(queue.subscribe(recorder(false).0).await.is_err());
        queue.close().await;
    }

    #[tokio::test]
    async fn close_stops_delivery() {
        let tmp = TempDir::new().unwrap();
        let queue = WorkQueue::new(config(tmp.path()));
        let (handler, mut rx) = recorder(false);
        queue.subscribe(handler).await.unwrap();
        queue.close().await;

        assert!(queue.enqueue(&QueueMessage::new("user-1", jane_doe())).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.depth().await.unwrap().pending, 1);
    }
}
