//! In-memory implementation of every store contract.
//!
//! All tables live behind one mutex. Each trait method takes the lock once
//! and finishes its work before releasing it, so the lock plays the part of
//! a database transaction: a claim reads the pending rows and writes their
//! leases atomically, and concurrent claimers can never observe the same
//! pending item. No method awaits while holding the lock.
//!
//! Used by the test suites of the service crates and by hosts that embed the
//! scheduler without PostgreSQL.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use lumen_core::defaults::QUEUE_MAX_RETRIES;
use lumen_core::*;

use crate::queue::LEASE_EXPIRED_MESSAGE;

/// Cosine similarity of two vectors; zero when either has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Default)]
struct Tables {
    folders: BTreeMap<Uuid, Folder>,
    images: BTreeMap<Uuid, Image>,
    queue: BTreeMap<Uuid, QueueItem>,
    workers: HashMap<EnrichmentKind, WorkerState>,
    cache: HashMap<(String, CacheContentKind), EmbeddingCacheEntry>,
    links: HashMap<(Uuid, CacheContentKind), String>,
    clusters: Vec<DuplicateCluster>,
}

impl Tables {
    fn has_active(&self, image_id: Uuid, kind: EnrichmentKind) -> bool {
        self.queue
            .values()
            .any(|q| q.image_id == image_id && q.kind == kind && q.status.is_active())
    }

    /// `(image, source)` for every image borrowing from something that is
    /// not a live representative.
    fn dangling(&self) -> impl Iterator<Item = (Uuid, Uuid)> + '_ {
        self.images.values().filter_map(|i| match i.embedding_source_id {
            Some(src) if src != i.id => {
                let live = self
                    .images
                    .get(&src)
                    .is_some_and(|s| s.is_embedding_representative);
                (!live).then_some((i.id, src))
            }
            _ => None,
        })
    }

    fn has_permanent_failure(&self, image_id: Uuid, kind: EnrichmentKind) -> bool {
        self.queue
            .values()
            .any(|q| q.image_id == image_id && q.kind == kind && q.is_permanently_failed())
    }

    fn push_item(&mut self, image_id: Uuid, kind: EnrichmentKind, priority: i32, queued_by: &str) {
        let item = QueueItem {
            id: new_v7(),
            image_id,
            kind,
            priority,
            status: QueueItemStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: QUEUE_MAX_RETRIES,
            queued_by: Some(queued_by.to_string()),
            lease_owner: None,
            leased_until: None,
        };
        self.queue.insert(item.id, item);
    }

    fn worker(&mut self, kind: EnrichmentKind) -> &mut WorkerState {
        self.workers
            .entry(kind)
            .or_insert_with(|| WorkerState::new(kind))
    }

    fn transition_error(&self, item_id: Uuid, to: &str) -> Error {
        match self.queue.get(&item_id) {
            Some(item) => Error::InvalidTransition {
                item_id,
                from: item.status.as_str().to_string(),
                to: to.to_string(),
            },
            None => Error::QueueItemNotFound(item_id),
        }
    }

    fn repair(&mut self, representatives: &[Uuid]) -> RepairReport {
        if representatives.is_empty() {
            return RepairReport::default();
        }
        let reps: HashSet<Uuid> = representatives.iter().copied().collect();
        let mut affected = Vec::new();
        for image in self.images.values_mut() {
            let borrows = matches!(image.embedding_source_id, Some(src) if reps.contains(&src));
            if borrows && !reps.contains(&image.id) {
                image.embedding_source_id = None;
                image.text_embedding = None;
                image.visual_embedding = None;
                image.is_embedding_representative = false;
                image.states.embedding = TaskState::NeverQueued;
                affected.push(image.id);
            }
        }
        for id in &reps {
            if let Some(image) = self.images.get_mut(id) {
                image.is_embedding_representative = false;
                image.embedding_source_id = None;
            }
        }
        let mut reps: Vec<Uuid> = reps.into_iter().collect();
        reps.sort();
        RepairReport {
            representatives: reps,
            affected_images: affected,
        }
    }

    fn release_links(&mut self, image_ids: &HashSet<Uuid>) -> u64 {
        let released: Vec<(Uuid, CacheContentKind)> = self
            .links
            .keys()
            .filter(|(image_id, _)| image_ids.contains(image_id))
            .copied()
            .collect();
        for key in &released {
            if let Some(hash) = self.links.remove(key) {
                if let Some(entry) = self.cache.get_mut(&(hash, key.1)) {
                    entry.ref_count = (entry.ref_count - 1).max(0);
                }
            }
        }
        released.len() as u64
    }

    fn delete_images(&mut self, ids: &[Uuid]) -> RepairReport {
        let deleted: HashSet<Uuid> = ids.iter().copied().collect();
        let mut sources: Vec<Uuid> = self
            .images
            .values()
            .filter(|i| !deleted.contains(&i.id))
            .filter_map(|i| i.embedding_source_id)
            .filter(|src| deleted.contains(src))
            .collect();
        sources.sort();
        sources.dedup();

        let mut report = self.repair(&sources);
        for id in ids {
            let flagged = self
                .images
                .get(id)
                .is_some_and(|i| i.is_embedding_representative);
            if flagged && !report.representatives.contains(id) {
                report.representatives.push(*id);
            }
        }
        report.representatives.sort();

        self.release_links(&deleted);
        self.images.retain(|id, _| !deleted.contains(id));
        self.queue.retain(|_, q| !deleted.contains(&q.image_id));
        self.clusters.retain_mut(|c| {
            c.members.retain(|m| !deleted.contains(m));
            !deleted.contains(&c.preferred) && !c.members.is_empty()
        });
        report
    }

    fn folder_tree(&self, root: Uuid) -> Vec<Uuid> {
        let mut tree = vec![root];
        let mut frontier = VecDeque::from([root]);
        while let Some(parent) = frontier.pop_front() {
            for folder in self.folders.values() {
                if folder.parent_id == Some(parent) {
                    tree.push(folder.id);
                    frontier.push_back(folder.id);
                }
            }
        }
        tree
    }

    fn link(
        &mut self,
        image_id: Uuid,
        kind: CacheContentKind,
        hash: &str,
    ) -> Result<EmbeddingCacheEntry> {
        if !self.images.contains_key(&image_id) {
            return Err(Error::ImageNotFound(image_id));
        }
        let previous = self.links.get(&(image_id, kind)).cloned();
        let already_linked = previous.as_deref() == Some(hash);
        if let Some(old) = previous.filter(|old| old != hash) {
            if let Some(entry) = self.cache.get_mut(&(old, kind)) {
                entry.ref_count = (entry.ref_count - 1).max(0);
            }
        }
        self.links.insert((image_id, kind), hash.to_string());

        let entry = self
            .cache
            .get_mut(&(hash.to_string(), kind))
            .ok_or_else(|| Error::NotFound(format!("cache entry {hash}")))?;
        if !already_linked {
            entry.ref_count += 1;
        }
        entry.last_used_at = Utc::now();
        let entry = entry.clone();

        let (text, visual) = match kind {
            CacheContentKind::Text => (Some(entry.vector.clone()), None),
            CacheContentKind::Pixels => (None, Some(entry.vector.clone())),
        };
        self.write_own_embeddings(image_id, text, visual)?;
        Ok(entry)
    }

    /// Own vectors replace borrowed ones; borrowers of `id` are detached.
    fn write_own_embeddings(
        &mut self,
        id: Uuid,
        text: Option<Vector>,
        visual: Option<Vector>,
    ) -> Result<()> {
        let image = self.images.get_mut(&id).ok_or(Error::ImageNotFound(id))?;
        if let Some(text) = text {
            image.text_embedding = Some(text);
        }
        if let Some(visual) = visual {
            image.visual_embedding = Some(visual);
        }
        if image.embedding_source_id != Some(id) {
            image.embedding_source_id = None;
        }
        for other in self.images.values_mut() {
            if other.id != id && other.embedding_source_id == Some(id) {
                other.embedding_source_id = None;
            }
        }
        Ok(())
    }
}

/// Shared in-memory store implementing every repository trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }

    /// Point `image_id` at `source` without the checks the repository
    /// methods apply. Reproduces rows written outside lumen, such as a
    /// catalog restored from an older backup.
    pub fn force_embedding_source(&self, image_id: Uuid, source: Uuid) -> Result<()> {
        let mut tables = self.lock()?;
        let image = tables
            .images
            .get_mut(&image_id)
            .ok_or(Error::ImageNotFound(image_id))?;
        image.embedding_source_id = Some(source);
        Ok(())
    }
}

fn kind_matches(filter: Option<EnrichmentKind>, kind: EnrichmentKind) -> bool {
    filter.map_or(true, |k| k == kind)
}

#[async_trait]
impl ImageRepository for MemoryStore {
    async fn insert(&self, image: NewImage) -> Result<Uuid> {
        let mut ids = self.insert_batch(vec![image]).await?;
        ids.pop()
            .ok_or_else(|| Error::Internal("insert returned no id".to_string()))
    }

    async fn insert_batch(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>> {
        let mut tables = self.lock()?;
        for image in &images {
            if let Some(folder_id) = image.folder_id {
                if !tables.folders.contains_key(&folder_id) {
                    return Err(Error::FolderNotFound(folder_id));
                }
            }
        }
        let mut ids = Vec::with_capacity(images.len());
        for new in images {
            let id = new_v7();
            tables.images.insert(
                id,
                Image {
                    id,
                    folder_id: new.folder_id,
                    filename: new.filename,
                    file_size: new.file_size,
                    params: new.params,
                    text_embedding: None,
                    visual_embedding: None,
                    metadata_fingerprint: None,
                    embedding_source_id: None,
                    is_embedding_representative: false,
                    states: TaskStates::default(),
                    created_at: Utc::now(),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>> {
        Ok(self.lock()?.images.get(&id).cloned())
    }

    async fn update_generation_params(&self, id: Uuid, params: GenerationParams) -> Result<()> {
        let mut tables = self.lock()?;
        let (is_rep, source) = tables
            .images
            .get(&id)
            .map(|i| (i.is_embedding_representative, i.embedding_source_id))
            .ok_or(Error::ImageNotFound(id))?;
        if is_rep {
            tables.repair(&[id]);
        }
        let image = tables.images.get_mut(&id).ok_or(Error::ImageNotFound(id))?;
        if !is_rep && matches!(source, Some(src) if src != id) {
            image.embedding_source_id = None;
            image.text_embedding = None;
            image.visual_embedding = None;
            image.states.embedding = TaskState::NeverQueued;
        }
        image.params = params;
        image.metadata_fingerprint = None;
        image.is_embedding_representative = false;
        if image.embedding_source_id == Some(id) {
            image.embedding_source_id = None;
        }
        Ok(())
    }

    async fn set_embeddings(
        &self,
        id: Uuid,
        text: Option<Vector>,
        visual: Option<Vector>,
    ) -> Result<()> {
        self.lock()?.write_own_embeddings(id, text, visual)
    }

    async fn delete_images(&self, ids: &[Uuid]) -> Result<RepairReport> {
        Ok(self.lock()?.delete_images(ids))
    }

    async fn create_folder(&self, parent_id: Option<Uuid>, path: &str) -> Result<Uuid> {
        let mut tables = self.lock()?;
        if let Some(parent) = parent_id {
            if !tables.folders.contains_key(&parent) {
                return Err(Error::FolderNotFound(parent));
            }
        }
        if tables.folders.values().any(|f| f.path == path) {
            return Err(Error::InvalidInput(format!("folder already exists: {path}")));
        }
        let id = new_v7();
        tables.folders.insert(
            id,
            Folder {
                id,
                parent_id,
                path: path.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn folder_image_ids(&self, folder_id: Uuid, recursive: bool) -> Result<Vec<Uuid>> {
        let tables = self.lock()?;
        if !tables.folders.contains_key(&folder_id) {
            return Err(Error::FolderNotFound(folder_id));
        }
        let folders: HashSet<Uuid> = if recursive {
            tables.folder_tree(folder_id).into_iter().collect()
        } else {
            HashSet::from([folder_id])
        };
        Ok(tables
            .images
            .values()
            .filter(|i| i.folder_id.is_some_and(|f| folders.contains(&f)))
            .map(|i| i.id)
            .collect())
    }

    async fn delete_folder(&self, folder_id: Uuid) -> Result<RepairReport> {
        let mut tables = self.lock()?;
        if !tables.folders.contains_key(&folder_id) {
            return Err(Error::FolderNotFound(folder_id));
        }
        let folders: HashSet<Uuid> = tables.folder_tree(folder_id).into_iter().collect();
        let image_ids: Vec<Uuid> = tables
            .images
            .values()
            .filter(|i| i.folder_id.is_some_and(|f| folders.contains(&f)))
            .map(|i| i.id)
            .collect();
        let report = tables.delete_images(&image_ids);
        tables.folders.retain(|id, _| !folders.contains(id));
        Ok(report)
    }
}

#[async_trait]
impl TaskStateRepository for MemoryStore {
    async fn set_state(
        &self,
        kind: EnrichmentKind,
        ids: &[Uuid],
        state: TaskState,
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut changed = 0;
        for id in ids.iter().collect::<HashSet<_>>() {
            if let Some(image) = tables.images.get_mut(id) {
                if image.states.get(kind) != state {
                    image.states.set(kind, state);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn smart_queue(
        &self,
        kind: EnrichmentKind,
        ids: &[Uuid],
        skip_already_processed: bool,
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut changed = 0;
        for id in ids.iter().collect::<HashSet<_>>() {
            if let Some(image) = tables.images.get_mut(id) {
                if let Some(next) =
                    smart_queue_transition(kind, image.states.get(kind), skip_already_processed)
                {
                    image.states.set(kind, next);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn clear_pending(&self, kind: EnrichmentKind) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut changed = 0;
        for image in tables.images.values_mut() {
            if image.states.get(kind) == TaskState::Pending {
                image.states.set(kind, TaskState::NeverQueued);
                changed += 1;
            }
        }
        tables
            .queue
            .retain(|_, q| !(q.kind == kind && q.status == QueueItemStatus::Pending));
        Ok(changed)
    }

    async fn enqueue_flagged(
        &self,
        kind: EnrichmentKind,
        priority: i32,
        queued_by: &str,
        limit: i64,
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let candidates: Vec<Uuid> = tables
            .images
            .values()
            .filter(|i| i.states.get(kind) == TaskState::Pending)
            .map(|i| i.id)
            .filter(|id| {
                !tables.has_active(*id, kind) && !tables.has_permanent_failure(*id, kind)
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .collect();
        for image_id in &candidates {
            tables.push_item(*image_id, kind, priority, queued_by);
        }
        Ok(candidates.len() as u64)
    }

    async fn counts(&self, kind: EnrichmentKind) -> Result<TaskStateCounts> {
        let tables = self.lock()?;
        let mut counts = TaskStateCounts::default();
        for image in tables.images.values() {
            match image.states.get(kind) {
                TaskState::NeverQueued => counts.never_queued += 1,
                TaskState::Pending => counts.pending += 1,
                TaskState::Completed => counts.completed += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn enqueue(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        priority: i32,
        queued_by: &str,
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut queued = 0;
        let mut seen = HashSet::new();
        for image_id in image_ids {
            if !seen.insert(*image_id)
                || !tables.images.contains_key(image_id)
                || tables.has_active(*image_id, kind)
            {
                continue;
            }
            tables.push_item(*image_id, kind, priority, queued_by);
            if let Some(image) = tables.images.get_mut(image_id) {
                image.states.set(kind, TaskState::Pending);
            }
            queued += 1;
        }
        Ok(queued)
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<QueueItem>> {
        let mut tables = self.lock()?;
        let mut pending: Vec<&QueueItem> = tables
            .queue
            .values()
            .filter(|q| q.kind == request.kind && q.status == QueueItemStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ids: Vec<Uuid> = pending
            .into_iter()
            .take(usize::try_from(request.size).unwrap_or(0))
            .map(|q| q.id)
            .collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = tables.queue.get_mut(&id) {
                item.status = QueueItemStatus::Processing;
                item.started_at = Some(now);
                item.lease_owner = Some(request.owner.clone());
                item.leased_until = Some(now + request.lease);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, item_id: Uuid) -> Result<CompletionOutcome> {
        let mut tables = self.lock()?;
        match tables.queue.get(&item_id).map(|q| q.status) {
            Some(QueueItemStatus::Processing) => {}
            Some(QueueItemStatus::Completed) => return Ok(CompletionOutcome::AlreadyCompleted),
            _ => return Err(tables.transition_error(item_id, "completed")),
        }
        let item = tables
            .queue
            .get_mut(&item_id)
            .ok_or(Error::QueueItemNotFound(item_id))?;
        item.status = QueueItemStatus::Completed;
        item.completed_at = Some(Utc::now());
        item.lease_owner = None;
        item.leased_until = None;
        let (image_id, kind) = (item.image_id, item.kind);
        if let Some(image) = tables.images.get_mut(&image_id) {
            image.states.set(kind, TaskState::Completed);
        }
        Ok(CompletionOutcome::Completed)
    }

    async fn fail(&self, item_id: Uuid, message: &str) -> Result<QueueItem> {
        let mut tables = self.lock()?;
        if tables.queue.get(&item_id).map(|q| q.status) != Some(QueueItemStatus::Processing) {
            return Err(tables.transition_error(item_id, "failed"));
        }
        let item = tables
            .queue
            .get_mut(&item_id)
            .ok_or(Error::QueueItemNotFound(item_id))?;
        item.status = QueueItemStatus::Failed;
        item.completed_at = Some(Utc::now());
        item.error_message = Some(message.to_string());
        item.retry_count += 1;
        item.lease_owner = None;
        item.leased_until = None;
        Ok(item.clone())
    }

    async fn retry_failed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut latest: HashMap<(Uuid, EnrichmentKind), (DateTime<Utc>, Uuid)> = HashMap::new();
        for item in tables.queue.values() {
            if item.status != QueueItemStatus::Failed
                || !item.can_retry()
                || !kind_matches(kind, item.kind)
                || tables.has_active(item.image_id, item.kind)
            {
                continue;
            }
            let key = (item.image_id, item.kind);
            let candidate = (item.queued_at, item.id);
            latest
                .entry(key)
                .and_modify(|best| {
                    if candidate > *best {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }
        for (_, id) in latest.values() {
            if let Some(item) = tables.queue.get_mut(id) {
                item.status = QueueItemStatus::Pending;
                item.started_at = None;
                item.completed_at = None;
                item.error_message = None;
                item.lease_owner = None;
                item.leased_until = None;
            }
        }
        Ok(latest.len() as u64)
    }

    async fn clear_completed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.queue.len();
        tables.queue.retain(|_, q| {
            !(kind_matches(kind, q.kind)
                && matches!(q.status, QueueItemStatus::Completed | QueueItemStatus::Failed))
        });
        Ok((before - tables.queue.len()) as u64)
    }

    async fn clear_all(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.queue.len();
        tables.queue.retain(|_, q| !kind_matches(kind, q.kind));
        Ok((before - tables.queue.len()) as u64)
    }

    async fn release_expired_leases(&self) -> Result<u64> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let mut released = 0;
        for item in tables.queue.values_mut() {
            let expired = item.status == QueueItemStatus::Processing
                && item.leased_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }
            item.retry_count += 1;
            item.error_message = Some(LEASE_EXPIRED_MESSAGE.to_string());
            item.started_at = None;
            item.lease_owner = None;
            item.leased_until = None;
            if item.retry_count < item.max_retries {
                item.status = QueueItemStatus::Pending;
                item.completed_at = None;
            } else {
                item.status = QueueItemStatus::Failed;
                item.completed_at = Some(now);
            }
            released += 1;
        }
        Ok(released)
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>> {
        Ok(self.lock()?.queue.get(&item_id).cloned())
    }

    async fn list(
        &self,
        kind: Option<EnrichmentKind>,
        status: Option<QueueItemStatus>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let tables = self.lock()?;
        let mut items: Vec<QueueItem> = tables
            .queue
            .values()
            .filter(|q| kind_matches(kind, q.kind) && status.map_or(true, |s| s == q.status))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then_with(|| b.id.cmp(&a.id)));
        items.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(items)
    }

    async fn stats(&self, kind: EnrichmentKind) -> Result<QueueStats> {
        let tables = self.lock()?;
        let mut stats = QueueStats::default();
        for item in tables.queue.values().filter(|q| q.kind == kind) {
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::Failed => {
                    stats.failed += 1;
                    if !item.can_retry() {
                        stats.permanently_failed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl WorkerStateRepository for MemoryStore {
    async fn get(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        Ok(self.lock()?.worker(kind).clone())
    }

    async fn set_status(
        &self,
        kind: EnrichmentKind,
        status: WorkerStatus,
    ) -> Result<WorkerState> {
        let mut tables = self.lock()?;
        let state = tables.worker(kind);
        let now = Utc::now();
        state.status = status;
        match status {
            WorkerStatus::Running => state.started_at = Some(now),
            WorkerStatus::Paused => state.paused_at = Some(now),
            WorkerStatus::Stopped => state.stopped_at = Some(now),
        }
        state.updated_at = now;
        Ok(state.clone())
    }

    async fn increment_counters(
        &self,
        kind: EnrichmentKind,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let state = tables.worker(kind);
        state.processed_count += processed;
        state.failed_count += failed;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn record_error(&self, kind: EnrichmentKind, message: &str) -> Result<()> {
        let mut tables = self.lock()?;
        let state = tables.worker(kind);
        let now = Utc::now();
        state.last_error = Some(message.to_string());
        state.last_error_at = Some(now);
        state.updated_at = now;
        Ok(())
    }

    async fn reset_counters(&self, kind: EnrichmentKind) -> Result<()> {
        let mut tables = self.lock()?;
        let state = tables.worker(kind);
        state.processed_count = 0;
        state.failed_count = 0;
        state.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DedupRepository for MemoryStore {
    async fn images_missing_fingerprint(&self, limit: i64) -> Result<Vec<FingerprintSource>> {
        let tables = self.lock()?;
        Ok(tables
            .images
            .values()
            .filter(|i| i.metadata_fingerprint.is_none() && i.params.has_generation_data())
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|i| FingerprintSource {
                id: i.id,
                params: i.params.clone(),
            })
            .collect())
    }

    async fn set_fingerprints(&self, values: &[(Uuid, String)]) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut updated = 0;
        for (id, fingerprint) in values {
            if let Some(image) = tables.images.get_mut(id) {
                image.metadata_fingerprint = Some(fingerprint.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn fingerprint_groups(
        &self,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FingerprintGroup>> {
        let tables = self.lock()?;
        let mut groups: BTreeMap<&str, Vec<GroupMember>> = BTreeMap::new();
        for image in tables.images.values() {
            if let Some(fp) = image.metadata_fingerprint.as_deref() {
                if after.map_or(true, |a| fp > a) {
                    groups.entry(fp).or_default().push(GroupMember {
                        id: image.id,
                        file_size: image.file_size,
                    });
                }
            }
        }
        Ok(groups
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(fp, members)| FingerprintGroup {
                fingerprint: fp.to_string(),
                members,
            })
            .collect())
    }

    async fn mark_representative(&self, fingerprint: &str, representative: Uuid) -> Result<bool> {
        let mut tables = self.lock()?;
        let mut demoted = HashSet::new();
        for image in tables.images.values_mut() {
            if image.metadata_fingerprint.as_deref() == Some(fingerprint)
                && image.is_embedding_representative
                && image.id != representative
            {
                image.is_embedding_representative = false;
                image.embedding_source_id = None;
                demoted.insert(image.id);
            }
        }
        let mut changed = !demoted.is_empty();
        for image in tables.images.values_mut() {
            if image
                .embedding_source_id
                .is_some_and(|src| demoted.contains(&src))
            {
                image.embedding_source_id = None;
                changed = true;
            }
        }
        if let Some(image) = tables.images.get_mut(&representative) {
            let in_group = image.metadata_fingerprint.as_deref() == Some(fingerprint);
            if in_group
                && (!image.is_embedding_representative
                    || image.embedding_source_id != Some(representative))
            {
                image.is_embedding_representative = true;
                image.embedding_source_id = Some(representative);
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn representatives(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        let tables = self.lock()?;
        Ok(tables
            .images
            .values()
            .filter(|i| i.is_embedding_representative && after.map_or(true, |a| i.id > a))
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|i| i.id)
            .collect())
    }

    async fn propagate_from(&self, representative: Uuid) -> Result<PropagationOutcome> {
        let mut tables = self.lock()?;
        let Some(rep) = tables
            .images
            .get(&representative)
            .filter(|i| i.is_embedding_representative)
        else {
            return Ok(PropagationOutcome::NotRepresentative);
        };
        let Some(fingerprint) = rep.metadata_fingerprint.clone() else {
            return Ok(PropagationOutcome::NotRepresentative);
        };
        if rep.text_embedding.is_none() && rep.visual_embedding.is_none() {
            return Ok(PropagationOutcome::NoVectors);
        }
        let (text, visual) = (rep.text_embedding.clone(), rep.visual_embedding.clone());

        let mut updated = HashSet::new();
        for image in tables.images.values_mut() {
            if image.id != representative
                && image.metadata_fingerprint.as_deref() == Some(fingerprint.as_str())
                && image.embedding_source_id != Some(representative)
            {
                image.text_embedding = text.clone();
                image.visual_embedding = visual.clone();
                image.embedding_source_id = Some(representative);
                image.is_embedding_representative = false;
                image.states.embedding = TaskState::Completed;
                updated.insert(image.id);
            }
        }
        tables.queue.retain(|_, q| {
            !(updated.contains(&q.image_id)
                && q.kind == EnrichmentKind::Embedding
                && q.status == QueueItemStatus::Pending)
        });
        Ok(PropagationOutcome::Propagated(updated.len() as u64))
    }

    async fn repair_orphans(&self, representatives: &[Uuid]) -> Result<RepairReport> {
        Ok(self.lock()?.repair(representatives))
    }

    async fn dangling_references(&self) -> Result<Vec<Uuid>> {
        Ok(self.lock()?.dangling().map(|(id, _)| id).collect())
    }

    async fn dangling_sources(&self) -> Result<Vec<Uuid>> {
        let tables = self.lock()?;
        let sources: BTreeSet<Uuid> = tables.dangling().map(|(_, src)| src).collect();
        Ok(sources.into_iter().collect())
    }
}

#[async_trait]
impl EmbeddingCacheRepository for MemoryStore {
    async fn lookup_and_link(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
    ) -> Result<CacheLookup> {
        let mut tables = self.lock()?;
        if !tables.cache.contains_key(&(content_hash.to_string(), kind)) {
            return Ok(CacheLookup::Miss);
        }
        tables.link(image_id, kind, content_hash).map(CacheLookup::Hit)
    }

    async fn store(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
        vector: Vector,
    ) -> Result<EmbeddingCacheEntry> {
        let mut tables = self.lock()?;
        if !tables.images.contains_key(&image_id) {
            return Err(Error::ImageNotFound(image_id));
        }
        let now = Utc::now();
        tables
            .cache
            .entry((content_hash.to_string(), kind))
            .or_insert_with(|| EmbeddingCacheEntry {
                content_hash: content_hash.to_string(),
                content_kind: kind,
                vector,
                ref_count: 0,
                last_used_at: now,
                created_at: now,
            });
        tables.link(image_id, kind, content_hash)
    }

    async fn release(&self, image_id: Uuid) -> Result<u64> {
        Ok(self.lock()?.release_links(&HashSet::from([image_id])))
    }

    async fn get(
        &self,
        kind: CacheContentKind,
        content_hash: &str,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        Ok(self
            .lock()?
            .cache
            .get(&(content_hash.to_string(), kind))
            .cloned())
    }

    async fn prune_unreferenced(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.lock()?;
        let linked: HashSet<(String, CacheContentKind)> = tables
            .links
            .iter()
            .map(|((_, kind), hash)| (hash.clone(), *kind))
            .collect();
        let before = tables.cache.len();
        tables.cache.retain(|key, entry| {
            entry.ref_count > 0 || entry.last_used_at >= older_than || linked.contains(key)
        });
        Ok((before - tables.cache.len()) as u64)
    }
}

#[async_trait]
impl SimilarityRepository for MemoryStore {
    async fn visual_corpus_size(&self) -> Result<i64> {
        let tables = self.lock()?;
        Ok(tables
            .images
            .values()
            .filter(|i| i.visual_embedding.is_some())
            .count() as i64)
    }

    async fn visual_image_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        let tables = self.lock()?;
        Ok(tables
            .images
            .values()
            .filter(|i| i.visual_embedding.is_some() && after.map_or(true, |a| i.id > a))
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|i| i.id)
            .collect())
    }

    async fn nearest_pairs(
        &self,
        image_ids: &[Uuid],
        neighbours: i64,
        threshold: f32,
        _ef_search: u32,
    ) -> Result<Vec<SimilarPair>> {
        let tables = self.lock()?;
        let corpus: Vec<(Uuid, &[f32])> = tables
            .images
            .values()
            .filter_map(|i| i.visual_embedding.as_ref().map(|v| (i.id, v.as_slice())))
            .collect();
        let k = usize::try_from(neighbours).unwrap_or(0);

        let mut pairs = Vec::new();
        for query_id in image_ids {
            let Some(query) = tables
                .images
                .get(query_id)
                .and_then(|i| i.visual_embedding.as_ref())
            else {
                continue;
            };
            let mut scored: Vec<(Uuid, f32)> = corpus
                .iter()
                .filter(|(id, _)| id != query_id)
                .map(|(id, v)| (*id, cosine_similarity(query.as_slice(), v)))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            pairs.extend(
                scored
                    .into_iter()
                    .take(k)
                    .filter(|(_, sim)| *sim >= threshold)
                    .filter_map(|(id, sim)| SimilarPair::new(*query_id, id, sim)),
            );
        }
        Ok(crate::similarity::dedupe_pairs(pairs))
    }

    async fn dimensions(&self, ids: &[Uuid]) -> Result<Vec<ImageDims>> {
        let tables = self.lock()?;
        let mut dims: Vec<ImageDims> = ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| tables.images.get(id))
            .map(|i| ImageDims {
                id: i.id,
                width: i.params.width,
                height: i.params.height,
            })
            .collect();
        dims.sort_by_key(|d| d.id);
        Ok(dims)
    }

    async fn variant_candidates(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ImageDescriptor>> {
        let tables = self.lock()?;
        Ok(tables
            .images
            .values()
            .filter(|i| {
                i.params.seed.is_some()
                    && i.params.model.is_some()
                    && after.map_or(true, |a| i.id > a)
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|i| ImageDescriptor {
                id: i.id,
                filename: i.filename.clone(),
                file_size: i.file_size,
                params: i.params.clone(),
            })
            .collect())
    }

    async fn materialize_clusters(&self, clusters: &[DuplicateCluster]) -> Result<u64> {
        let mut tables = self.lock()?;
        tables.clusters = clusters.to_vec();
        Ok(clusters.len() as u64)
    }

    async fn materialized_clusters(&self) -> Result<Vec<DuplicateCluster>> {
        Ok(self.lock()?.clusters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> Vector {
        Vector::from(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let id = ImageRepository::insert(&store, NewImage::new("a.png", 10))
            .await
            .unwrap();
        let image = ImageRepository::get(&store, id).await.unwrap().unwrap();
        assert_eq!(image.filename, "a.png");
        assert_eq!(image.states, TaskStates::default());
    }

    #[tokio::test]
    async fn test_insert_into_missing_folder_fails() {
        let store = MemoryStore::new();
        let missing = Uuid::now_v7();
        let err = ImageRepository::insert(&store, NewImage::new("a.png", 1).in_folder(missing))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FolderNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_cache_refcount_moves_with_links() {
        let store = MemoryStore::new();
        let a = ImageRepository::insert(&store, NewImage::new("a.png", 1)).await.unwrap();
        let b = ImageRepository::insert(&store, NewImage::new("b.png", 1)).await.unwrap();

        let entry = store
            .store(a, CacheContentKind::Pixels, "h1", vector(&[1.0, 2.0]))
            .await
            .unwrap();
        assert_eq!(entry.ref_count, 1);

        let hit = store
            .lookup_and_link(b, CacheContentKind::Pixels, "h1")
            .await
            .unwrap();
        match hit {
            CacheLookup::Hit(entry) => assert_eq!(entry.ref_count, 2),
            CacheLookup::Miss => panic!("expected a cache hit"),
        }
        // Linking the same content twice does not double count.
        store
            .lookup_and_link(b, CacheContentKind::Pixels, "h1")
            .await
            .unwrap();
        let entry = EmbeddingCacheRepository::get(&store, CacheContentKind::Pixels, "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.ref_count, 2);

        let image = ImageRepository::get(&store, b).await.unwrap().unwrap();
        assert_eq!(image.visual_embedding, Some(vector(&[1.0, 2.0])));

        ImageRepository::delete_images(&store, &[a, b]).await.unwrap();
        let entry = EmbeddingCacheRepository::get(&store, CacheContentKind::Pixels, "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.ref_count, 0);

        let pruned = store
            .prune_unreferenced(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_cache_miss_leaves_image_untouched() {
        let store = MemoryStore::new();
        let a = ImageRepository::insert(&store, NewImage::new("a.png", 1)).await.unwrap();
        let lookup = store
            .lookup_and_link(a, CacheContentKind::Text, "unknown")
            .await
            .unwrap();
        assert!(!lookup.is_hit());
        let image = ImageRepository::get(&store, a).await.unwrap().unwrap();
        assert!(image.text_embedding.is_none());
    }

    #[tokio::test]
    async fn test_worker_state_created_on_first_use() {
        let store = MemoryStore::new();
        let state = WorkerStateRepository::get(&store, EnrichmentKind::Tagging)
            .await
            .unwrap();
        assert_eq!(state.status, WorkerStatus::Stopped);

        store
            .increment_counters(EnrichmentKind::Tagging, 3, 1)
            .await
            .unwrap();
        let state = store
            .set_status(EnrichmentKind::Tagging, WorkerStatus::Paused)
            .await
            .unwrap();
        assert_eq!(state.processed_count, 3);
        assert_eq!(state.failed_count, 1);
        assert!(state.paused_at.is_some());
    }

    #[tokio::test]
    async fn test_nearest_pairs_brute_force() {
        let store = MemoryStore::new();
        let a = ImageRepository::insert(&store, NewImage::new("a.png", 1)).await.unwrap();
        let b = ImageRepository::insert(&store, NewImage::new("b.png", 1)).await.unwrap();
        let c = ImageRepository::insert(&store, NewImage::new("c.png", 1)).await.unwrap();
        store.set_embeddings(a, None, Some(vector(&[1.0, 0.0]))).await.unwrap();
        store.set_embeddings(b, None, Some(vector(&[0.99, 0.01]))).await.unwrap();
        store.set_embeddings(c, None, Some(vector(&[0.0, 1.0]))).await.unwrap();

        let pairs = store.nearest_pairs(&[a, b, c], 5, 0.95, 40).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].a, pairs[0].b), (a.min(b), a.max(b)));
    }
}
