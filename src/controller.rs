use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::cache::KeyedCache;
use crate::config::FeedConfig;
use crate::pages::{PageLoader, PageOutcome};
use crate::record::{Avatar, Cursor, Record, RecordId};
use crate::source::FeedSource;
use crate::tasks::{TaskCoordinator, TaskOutcome, TaskStats};
use crate::{FeedError, Result};

/// Published view of the feed. Readers never touch the live list, they
/// get the snapshot taken after the latest mutation. Records left alone by
/// a mutation are shared with the previous snapshot.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    /// Bumped on every published mutation
    pub revision: u64,
    pub records: Arc<Vec<Arc<Record>>>,
    pub loading_page: bool,
    /// Last page or image failure, for display next to the list
    pub last_error: Option<String>,
}

/// What applying a completion did to the feed.
#[derive(Debug)]
pub enum FeedEvent {
    PageAppended { cursor: Cursor, count: usize },
    PageFailed { cursor: Cursor, error: FeedError },
    ImageResolved { id: RecordId },
    ImageFailed { id: RecordId, error: FeedError },
    /// A superseded or unexpected completion was dropped
    Discarded,
}

/// How a visible row got its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAction {
    /// The record already carries an image
    AlreadyResolved,
    /// Served from the cache, nothing was fetched
    CacheHit,
    /// A download was started, replacing any download for the same id
    Requested,
    /// No loaded record has this id
    UnknownRow,
}

/// Requests accepted by a running controller, see [`FeedHandle`].
#[derive(Debug)]
pub enum Command {
    Start,
    RowVisible { id: RecordId, position: usize },
    Shutdown,
}

enum Wake {
    Command(Option<Command>),
    Image(TaskOutcome<RecordId, Avatar>),
    Page(PageOutcome),
}

/// Owner of the feed state.
///
/// The rendering layer reports visible rows, the controller decides which
/// page to load next and which avatars to download. Every mutation of the
/// record list, the avatar cache and the download registry happens through
/// `&mut self`; fetches run on spawned tasks and come back as completions
/// that are applied by [`Self::next_event`] or by the [`Self::run`] loop.
pub struct ScrollController<S: FeedSource> {
    config: FeedConfig,
    source: Arc<S>,
    records: Vec<Arc<Record>>,
    cache: KeyedCache<RecordId, Avatar>,
    tasks: TaskCoordinator<RecordId, Avatar>,
    pages: PageLoader<S>,
    image_outcomes: mpsc::UnboundedReceiver<TaskOutcome<RecordId, Avatar>>,
    page_outcomes: mpsc::UnboundedReceiver<PageOutcome>,
    published: watch::Sender<FeedSnapshot>,
    revision: u64,
    last_error: Option<String>,
}

impl<S: FeedSource> ScrollController<S> {
    pub fn new(source: Arc<S>, config: FeedConfig) -> Result<Self> {
        config.validate()?;

        let cache = match config.cache_limit() {
            Some(capacity) => {
                KeyedCache::bounded("avatars".to_string(), capacity)
            }
            None => KeyedCache::unbounded("avatars".to_string()),
        };
        let (image_tx, image_outcomes) = mpsc::unbounded_channel();
        let tasks = TaskCoordinator::new(
            "avatars".to_string(),
            image_tx,
            config.max_concurrent_downloads,
        );
        let (page_tx, page_outcomes) = mpsc::unbounded_channel();
        let pages = PageLoader::new(source.clone(), page_tx);
        let (published, _) = watch::channel(FeedSnapshot::default());

        Ok(Self {
            config,
            source,
            records: Vec::new(),
            cache,
            tasks,
            pages,
            image_outcomes,
            page_outcomes,
            published,
            revision: 0,
            last_error: None,
        })
    }

    /// Initial display: an empty feed loads its first page.
    pub fn on_start(&mut self) -> bool {
        if !self.records.is_empty() {
            return false;
        }
        let issued = self.pages.load_next(0);
        if issued {
            self.publish();
        }
        issued
    }

    /// The rendering layer shows the row at `position` holding record
    /// `id`.
    ///
    /// Loads the next page when `id` sits at the prefetch threshold, then
    /// makes sure the record gets its avatar. `position` is only a hint,
    /// the record is resolved by id.
    pub fn on_row_visible(
        &mut self,
        id: RecordId,
        position: usize,
    ) -> ImageAction {
        log::trace!("feed: row {} visible at {}", id, position);

        if self.should_load_more(id) && self.pages.load_next(self.records.len())
        {
            self.publish();
        }

        let index = match self.locate(id, position) {
            Some(index) => index,
            None => {
                log::warn!("feed: no record with id {} is loaded", id);
                return ImageAction::UnknownRow;
            }
        };

        if self.records[index].has_image() {
            return ImageAction::AlreadyResolved;
        }

        if let Some(avatar) = self.cache.get(&id) {
            log::debug!("feed: avatar for {} served from cache", id);
            self.attach(id, avatar);
            self.publish();
            return ImageAction::CacheHit;
        }

        let source = self.source.clone();
        let uri = self.records[index].avatar_ref.clone();
        self.tasks
            .request(id, async move { source.fetch_image(&uri).await });
        ImageAction::Requested
    }

    /// Pagination trigger: the visible id equals the number of loaded
    /// records minus the prefetch distance. It compares against the
    /// identity, not the row position.
    pub fn should_load_more(&self, id: RecordId) -> bool {
        (self.records.len() as u64).checked_sub(self.config.prefetch_distance)
            == Some(id)
    }

    /// Waits for the next completion and applies it.
    ///
    /// Returns `None` when nothing is in flight.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        if !self.has_pending_work() {
            return None;
        }
        let wake = tokio::select! {
            Some(outcome) = self.image_outcomes.recv() => Wake::Image(outcome),
            Some(outcome) = self.page_outcomes.recv() => Wake::Page(outcome),
            else => return None,
        };
        self.handle(wake)
    }

    /// Applies completions until no page or avatar is in flight.
    pub async fn settle(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    /// Serves commands and completions until shut down or until every
    /// [`FeedHandle`] is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::debug!("feed: controller running");
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(outcome) = self.image_outcomes.recv() => Wake::Image(outcome),
                Some(outcome) = self.page_outcomes.recv() => Wake::Page(outcome),
            };
            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => {
                    break
                }
                wake => {
                    self.handle(wake);
                }
            }
        }
        self.shutdown();
        log::debug!("feed: controller stopped");
    }

    /// Moves the controller onto its own task.
    pub fn spawn(self) -> FeedHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let snapshots = self.subscribe();
        tokio::spawn(self.run(receiver));
        FeedHandle {
            commands,
            snapshots,
        }
    }

    /// Cancels the outstanding page and every download.
    pub fn shutdown(&mut self) {
        self.tasks.cancel_all();
        self.pages.cancel();
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.published.subscribe()
    }

    pub fn records(&self) -> &[Arc<Record>] {
        &self.records
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id).map(Arc::as_ref)
    }

    pub fn has_pending_work(&self) -> bool {
        self.pages.is_loading() || self.tasks.in_flight_count() > 0
    }

    pub fn is_loading_page(&self) -> bool {
        self.pages.is_loading()
    }

    pub fn is_downloading(&self, id: RecordId) -> bool {
        self.tasks.is_in_flight(&id)
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages.pages_loaded()
    }

    pub fn cached_avatars(&self) -> usize {
        self.cache.len()
    }

    pub fn download_stats(&self) -> TaskStats {
        self.tasks.stats()
    }

    fn handle(&mut self, wake: Wake) -> Option<FeedEvent> {
        match wake {
            Wake::Image(outcome) => Some(self.apply_image(outcome)),
            Wake::Page(outcome) => Some(self.apply_page(outcome)),
            Wake::Command(Some(command)) => {
                self.apply_command(command);
                None
            }
            Wake::Command(None) => None,
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                self.on_start();
            }
            Command::RowVisible { id, position } => {
                self.on_row_visible(id, position);
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn apply_image(
        &mut self,
        outcome: TaskOutcome<RecordId, Avatar>,
    ) -> FeedEvent {
        let id = outcome.key;
        match self.tasks.finish(outcome) {
            Some(Ok(avatar)) => {
                self.cache.put(id, avatar.clone());
                self.attach(id, avatar);
                self.publish();
                FeedEvent::ImageResolved { id }
            }
            Some(Err(error)) => {
                self.last_error =
                    Some(format!("avatar for {} failed: {}", id, error));
                self.publish();
                FeedEvent::ImageFailed { id, error }
            }
            None => FeedEvent::Discarded,
        }
    }

    fn apply_page(&mut self, outcome: PageOutcome) -> FeedEvent {
        let cursor = outcome.cursor;
        match self.pages.complete(outcome, &mut self.records) {
            Some(Ok(count)) => {
                self.publish();
                FeedEvent::PageAppended { cursor, count }
            }
            Some(Err(error)) => {
                self.last_error =
                    Some(format!("page {} failed: {}", cursor, error));
                self.publish();
                FeedEvent::PageFailed { cursor, error }
            }
            None => FeedEvent::Discarded,
        }
    }

    fn locate(&self, id: RecordId, position: usize) -> Option<usize> {
        match self.records.get(position) {
            Some(record) if record.id == id => Some(position),
            _ => self.records.iter().position(|r| r.id == id),
        }
    }

    /// Duplicate ids across pages share one identity, so all of them get
    /// the avatar.
    fn attach(&mut self, id: RecordId, avatar: Avatar) {
        for record in self.records.iter_mut().filter(|r| r.id == id) {
            Arc::make_mut(record).image = Some(avatar.clone());
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.published.send_replace(FeedSnapshot {
            revision: self.revision,
            records: Arc::new(self.records.clone()),
            loading_page: self.pages.is_loading(),
            last_error: self.last_error.clone(),
        });
    }
}

/// Cloneable access to a controller running on its own task.
///
/// Sending never blocks, so it is safe to call from a rendering thread.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<FeedSnapshot>,
}

impl FeedHandle {
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    pub fn row_visible(&self, id: RecordId, position: usize) -> Result<()> {
        self.send(Command::RowVisible { id, position })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// The latest published state.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|e| {
            FeedError::Other(anyhow::anyhow!(
                "feed controller is gone, dropped {:?}",
                e.0
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::DynamicImage;
    use rstest::rstest;

    use super::*;

    /// Serves a fixed listing in pages of `per_page` and avatars whose
    /// width is the record id.
    struct FixedListing {
        total: u64,
        per_page: u64,
        image_requests: Mutex<Vec<String>>,
    }

    impl FixedListing {
        fn new(total: u64, per_page: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                per_page,
                image_requests: Mutex::new(Vec::new()),
            })
        }

        fn image_requests(&self) -> Vec<String> {
            self.image_requests.lock().unwrap().clone()
        }
    }

    impl FeedSource for FixedListing {
        async fn fetch_page(&self, cursor: Cursor) -> Result<Vec<Record>> {
            let last = (cursor.since + self.per_page - 1).min(self.total);
            Ok((cursor.since..=last)
                .map(|id| {
                    Record::new(id, format!("mem://{id}"), format!("user{id}"))
                })
                .collect())
        }

        async fn fetch_image(&self, uri: &str) -> Result<Avatar> {
            self.image_requests.lock().unwrap().push(uri.to_string());
            let width = uri
                .trim_start_matches("mem://")
                .parse::<u32>()
                .map_err(|e| FeedError::Decode(e.to_string()))?;
            Ok(Avatar::new(DynamicImage::new_rgba8(width, 1)))
        }
    }

    async fn started(source: Arc<FixedListing>) -> ScrollController<FixedListing> {
        let mut feed =
            ScrollController::new(source, FeedConfig::default()).unwrap();
        assert!(feed.on_start());
        feed.settle().await;
        feed
    }

    #[tokio::test]
    async fn test_start_loads_first_page_once() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source).await;

        assert_eq!(feed.records().len(), 5);
        assert_eq!(feed.pages_loaded(), 1);
        assert!(!feed.on_start());
        assert!(!feed.has_pending_work());
    }

    #[rstest]
    #[case(5, 2, true)]
    #[case(5, 3, false)]
    #[case(5, 4, false)]
    #[case(2, 0, false)]
    #[case(3, 0, true)]
    #[tokio::test]
    async fn test_threshold_compares_identity(
        #[case] loaded: u64,
        #[case] id: RecordId,
        #[case] expected: bool,
    ) {
        let source = FixedListing::new(loaded, loaded);
        let feed = started(source).await;
        assert_eq!(feed.records().len() as u64, loaded);
        assert_eq!(feed.should_load_more(id), expected);
    }

    #[tokio::test]
    async fn test_visible_row_gets_its_avatar() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source.clone()).await;

        assert_eq!(feed.on_row_visible(4, 3), ImageAction::Requested);
        assert!(feed.is_downloading(4));
        let events = feed.settle().await;

        assert!(matches!(events[..], [FeedEvent::ImageResolved { id: 4 }]));
        assert_eq!(feed.record(4).unwrap().image.as_ref().unwrap().width(), 4);
        assert_eq!(feed.cached_avatars(), 1);
        assert_eq!(source.image_requests(), vec!["mem://4".to_string()]);
    }

    #[tokio::test]
    async fn test_resolved_row_does_not_refetch() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source.clone()).await;

        feed.on_row_visible(1, 0);
        feed.settle().await;

        assert_eq!(feed.on_row_visible(1, 0), ImageAction::AlreadyResolved);
        assert!(!feed.has_pending_work());
        assert_eq!(source.image_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_download() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source.clone()).await;

        feed.on_row_visible(2, 1);
        feed.settle().await;
        // Forget the attached image, the cache still has it
        Arc::make_mut(&mut feed.records[1]).image = None;

        assert_eq!(feed.on_row_visible(2, 1), ImageAction::CacheHit);
        assert!(!feed.is_downloading(2));
        assert!(feed.records()[1].has_image());
        assert_eq!(feed.download_stats().started, 1);
        assert_eq!(source.image_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_position_is_only_a_hint() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source).await;

        // Record 5 lives at position 4, the reported position is off
        assert_eq!(feed.on_row_visible(5, 0), ImageAction::Requested);
        feed.settle().await;
        assert!(feed.record(5).unwrap().has_image());
        assert!(!feed.records()[0].has_image());

        assert_eq!(feed.on_row_visible(999, 2), ImageAction::UnknownRow);
    }

    #[tokio::test]
    async fn test_threshold_row_loads_next_page() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source).await;

        // 5 loaded, prefetch distance 3: id 2 is the trigger
        feed.on_row_visible(2, 1);
        assert!(feed.is_loading_page());
        feed.settle().await;

        let ids: Vec<_> = feed.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(feed.pages_loaded(), 2);
    }

    #[tokio::test]
    async fn test_failed_avatar_is_reported() {
        let source = Arc::new(FixedListing {
            total: 3,
            per_page: 3,
            image_requests: Mutex::new(Vec::new()),
        });
        let mut feed = started(source).await;
        Arc::make_mut(&mut feed.records[0]).avatar_ref =
            "mem://broken".to_string();
        let snapshots = feed.subscribe();

        feed.on_row_visible(1, 0);
        let events = feed.settle().await;

        assert!(matches!(
            events[..],
            [FeedEvent::ImageFailed {
                id: 1,
                error: FeedError::Decode(_)
            }]
        ));
        assert!(!feed.records()[0].has_image());
        assert_eq!(feed.cached_avatars(), 0);
        assert!(snapshots.borrow().last_error.is_some());
    }

    #[tokio::test]
    async fn test_snapshots_follow_mutations() {
        let source = FixedListing::new(100, 5);
        let mut feed =
            ScrollController::new(source, FeedConfig::default()).unwrap();
        let snapshots = feed.subscribe();
        assert_eq!(snapshots.borrow().revision, 0);

        feed.on_start();
        assert!(snapshots.borrow().loading_page);
        feed.settle().await;

        let snapshot = snapshots.borrow().clone();
        assert!(!snapshot.loading_page);
        assert_eq!(snapshot.records.len(), 5);
        assert!(snapshot.revision >= 2);
    }

    #[tokio::test]
    async fn test_snapshots_share_untouched_records() {
        let source = FixedListing::new(100, 5);
        let mut feed = started(source).await;
        let snapshots = feed.subscribe();
        let before = snapshots.borrow().clone();

        feed.on_row_visible(3, 2);
        feed.settle().await;
        let after = snapshots.borrow().clone();

        assert!(after.revision > before.revision);
        assert!(after.records[2].has_image());
        assert!(!before.records[2].has_image());
        for i in [0, 1, 3, 4] {
            assert!(Arc::ptr_eq(&before.records[i], &after.records[i]));
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = FeedConfig {
            per_page: 0,
            ..FeedConfig::default()
        };
        let result = ScrollController::new(FixedListing::new(1, 1), config);
        assert!(matches!(result, Err(FeedError::Config(_))));
    }
}
