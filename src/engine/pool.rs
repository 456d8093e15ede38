//! Instance pool
//!
//! Owns every instance. Satisfies each request by selecting or creating an
//! appropriate instance, enforces the global concurrency cap, and releases
//! instances on completion or cancellation.
//!
//! Routing prefers warmth: among idle slots of the requested model, the one
//! whose chat history shares the longest message prefix with the request
//! wins; with no overlap anywhere, the least-recently-used idle slot is
//! taken. With the cap reached, requests queue FIFO and are matched to
//! slots as they free up, evicting and replacing an instance only when the
//! queued model differs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{common_prefix_len, ChatMessage};
use crate::config::GatewayConfig;
use crate::download::Downloader;
use crate::engine::turn::run_chat_turn;
use crate::engine::{
    ChatRequest, ChatResult, ChunkCallback, CompletionRequest, CompletionResult, EmbeddingRequest,
    EmbeddingResult, Instance,
};
use crate::error::{GatewayError, Result};
use crate::runtime::RuntimeBackend;

pub struct Pool {
    backend: Arc<dyn RuntimeBackend>,
    config: GatewayConfig,
    downloader: Downloader,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot is removed or parked idle; `dispose`
    /// waits on it while draining.
    slot_freed: Notify,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    next_slot_id: u64,
    next_waiter_id: u64,
    in_flight: usize,
    draining: bool,
}

struct Slot {
    id: u64,
    model: String,
    state: SlotState,
    last_used: Instant,
}

enum SlotState {
    Loading { cancel: CancellationToken },
    Idle(Box<Instance>),
    Busy { cancel: CancellationToken },
}

struct Waiter {
    id: u64,
    model: String,
    cancel: CancellationToken,
    tx: oneshot::Sender<WakeUp>,
}

enum WakeUp {
    /// A warm instance of the right model, leased directly
    Ready { slot_id: u64, instance: Box<Instance> },
    /// A slot reserved for the waiter's model; the waiter spawns into it
    Spawn { slot_id: u64 },
    Shutdown,
}

pub(crate) struct Lease {
    slot_id: u64,
    pub(crate) instance: Box<Instance>,
}

enum Admission {
    Ready(Lease),
    Spawn(u64),
    Wait(u64, oneshot::Receiver<WakeUp>),
}

/// Pool status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub models: HashMap<String, ModelStatus>,
    pub queue_depth: usize,
    pub in_flight: usize,
}

/// Per-model slot counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelStatus {
    pub loading: usize,
    pub idle: usize,
    pub busy: usize,
}

impl PoolState {
    fn slot_mut(&mut self, slot_id: u64) -> &mut Slot {
        self.slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .expect("slot exists")
    }

    fn remove_slot(&mut self, slot_id: u64) {
        self.slots.retain(|s| s.id != slot_id);
    }

    fn reserve_slot(&mut self, model: &str, cancel: &CancellationToken) -> u64 {
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        self.slots.push(Slot {
            id,
            model: model.to_string(),
            state: SlotState::Loading {
                cancel: cancel.clone(),
            },
            last_used: Instant::now(),
        });
        id
    }

    /// Best idle slot of `model`: highest affinity score (ties broken by
    /// most recent use); with no overlap anywhere, least recently used.
    fn pick_idle(&self, model: &str, messages: &[ChatMessage]) -> Option<u64> {
        let mut best: Option<(u64, usize, Instant)> = None;
        for slot in &self.slots {
            if slot.model != model {
                continue;
            }
            let SlotState::Idle(instance) = &slot.state else {
                continue;
            };
            let score = common_prefix_len(&instance.chat_history, messages);
            let better = match best {
                None => true,
                Some((_, best_score, best_used)) => {
                    if score != best_score {
                        score > best_score
                    } else if score >= 1 {
                        slot.last_used > best_used
                    } else {
                        slot.last_used < best_used
                    }
                }
            };
            if better {
                best = Some((slot.id, score, slot.last_used));
            }
        }
        best.map(|(id, _, _)| id)
    }

    /// Least-recently-used idle slot of any other model, for
    /// evict-and-replace at admission.
    fn pick_idle_other(&self, model: &str) -> Option<u64> {
        self.slots
            .iter()
            .filter(|s| s.model != model && matches!(s.state, SlotState::Idle(_)))
            .min_by_key(|s| s.last_used)
            .map(|s| s.id)
    }

    /// With free capacity, hand the oldest waiter a reserved slot to
    /// spawn into.
    fn dispatch_capacity(&mut self, concurrency: usize) {
        while !self.draining && self.slots.len() < concurrency {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let slot_id = self.reserve_slot(&waiter.model, &waiter.cancel);
            if waiter.tx.send(WakeUp::Spawn { slot_id }).is_err() {
                // Waiter cancelled between queueing and now.
                self.remove_slot(slot_id);
                continue;
            }
            break;
        }
    }
}

impl Pool {
    pub fn new(config: GatewayConfig, backend: Arc<dyn RuntimeBackend>) -> Self {
        let models_dir = config.models_dir();
        if let Err(e) = std::fs::create_dir_all(&models_dir) {
            warn!(dir = %models_dir.display(), error = %e, "cannot create models dir");
        }
        Pool {
            backend,
            config,
            downloader: Downloader::new(),
            state: Mutex::new(PoolState::default()),
            slot_freed: Notify::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve a chat-completion request against a named model.
    pub async fn chat(
        &self,
        model_name: &str,
        request: ChatRequest,
        on_chunk: Option<ChunkCallback>,
        cancel: CancellationToken,
    ) -> Result<ChatResult> {
        self.config.model(model_name)?;
        let mut lease = self.lease(model_name, &request.messages, &cancel).await?;
        let result = run_chat_turn(&mut lease.instance, &request, on_chunk, &cancel).await;
        self.finish(lease, result.as_ref().err()).await;
        result
    }

    /// Serve a text-completion request. Never touches chat state.
    pub async fn completion(
        &self,
        model_name: &str,
        request: CompletionRequest,
        on_chunk: Option<ChunkCallback>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        self.config.model(model_name)?;
        let mut lease = self.lease(model_name, &[], &cancel).await?;
        let result = lease.instance.completion(&request, on_chunk, &cancel).await;
        self.finish(lease, result.as_ref().err()).await;
        result
    }

    /// Serve an embedding request.
    pub async fn embeddings(
        &self,
        model_name: &str,
        request: EmbeddingRequest,
        cancel: CancellationToken,
    ) -> Result<EmbeddingResult> {
        self.config.model(model_name)?;
        let mut lease = self.lease(model_name, &[], &cancel).await?;
        let result = lease.instance.embeddings(&request).await;
        self.finish(lease, result.as_ref().err()).await;
        result
    }

    /// Snapshot of per-model slot counts, queue depth, and in-flight
    /// requests.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut models: HashMap<String, ModelStatus> = HashMap::new();
        for name in self.config.models.keys() {
            models.insert(name.clone(), ModelStatus::default());
        }
        for slot in &state.slots {
            let entry = models.entry(slot.model.clone()).or_default();
            match slot.state {
                SlotState::Loading { .. } => entry.loading += 1,
                SlotState::Idle(_) => entry.idle += 1,
                SlotState::Busy { .. } => entry.busy += 1,
            }
        }
        PoolStatus {
            models,
            queue_depth: state.waiters.len(),
            in_flight: state.in_flight,
        }
    }

    /// Drain the pool: fail queued requests, abort in-flight ones, and
    /// dispose every instance. Resolves once no slots remain.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().await;
            if !state.draining {
                info!("pool draining");
                state.draining = true;
            }
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(WakeUp::Shutdown);
            }
            let mut i = 0;
            while i < state.slots.len() {
                if matches!(state.slots[i].state, SlotState::Idle(_)) {
                    state.slots.remove(i);
                    continue;
                }
                if let SlotState::Busy { cancel } | SlotState::Loading { cancel } =
                    &state.slots[i].state
                {
                    cancel.cancel();
                }
                i += 1;
            }
        }
        self.slot_freed.notify_waiters();

        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.state.lock().await.slots.is_empty() {
                break;
            }
            freed.await;
        }
    }

    pub(crate) async fn lease(
        &self,
        model_name: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let admission = {
            let mut state = self.state.lock().await;
            if state.draining {
                return Err(GatewayError::ShuttingDown);
            }

            if let Some(slot_id) = state.pick_idle(model_name, messages) {
                let slot = state.slot_mut(slot_id);
                let SlotState::Idle(instance) = std::mem::replace(
                    &mut slot.state,
                    SlotState::Busy {
                        cancel: cancel.clone(),
                    },
                ) else {
                    unreachable!("pick_idle returns idle slots");
                };
                slot.last_used = Instant::now();
                state.in_flight += 1;
                Admission::Ready(Lease { slot_id, instance })
            } else if state.slots.len() < self.config.concurrency {
                let slot_id = state.reserve_slot(model_name, cancel);
                Admission::Spawn(slot_id)
            } else if let Some(slot_id) = state.pick_idle_other(model_name) {
                // Cap reached with a colder model idle: evict and replace.
                let slot = state.slot_mut(slot_id);
                debug!(old = %slot.model, new = model_name, "evicting idle instance");
                slot.model = model_name.to_string();
                slot.state = SlotState::Loading {
                    cancel: cancel.clone(),
                };
                Admission::Spawn(slot_id)
            } else {
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    id,
                    model: model_name.to_string(),
                    cancel: cancel.clone(),
                    tx,
                });
                Admission::Wait(id, rx)
            }
        };

        match admission {
            Admission::Ready(lease) => Ok(lease),
            Admission::Spawn(slot_id) => self.spawn_into(slot_id, model_name, cancel).await,
            Admission::Wait(waiter_id, mut rx) => {
                tokio::select! {
                    wake = &mut rx => match wake {
                        Ok(WakeUp::Ready { slot_id, instance }) => Ok(Lease { slot_id, instance }),
                        Ok(WakeUp::Spawn { slot_id }) => {
                            self.spawn_into(slot_id, model_name, cancel).await
                        }
                        Ok(WakeUp::Shutdown) | Err(_) => Err(GatewayError::ShuttingDown),
                    },
                    _ = cancel.cancelled() => {
                        self.abandon_wait(waiter_id, rx).await;
                        Err(GatewayError::Cancelled)
                    }
                }
            }
        }
    }

    /// Remove a cancelled waiter, unwinding a wake-up that raced in.
    async fn abandon_wait(&self, waiter_id: u64, rx: oneshot::Receiver<WakeUp>) {
        let still_queued = {
            let mut state = self.state.lock().await;
            let before = state.waiters.len();
            state.waiters.retain(|w| w.id != waiter_id);
            state.waiters.len() != before
        };
        if still_queued {
            return;
        }
        // The wake-up was already sent; give back whatever it carried.
        match rx.await {
            Ok(WakeUp::Ready { slot_id, instance }) => {
                let mut state = self.state.lock().await;
                state.in_flight -= 1;
                drop(state);
                self.park_or_dispatch(slot_id, instance).await;
            }
            Ok(WakeUp::Spawn { slot_id }) => {
                let mut state = self.state.lock().await;
                state.remove_slot(slot_id);
                state.dispatch_capacity(self.config.concurrency);
                drop(state);
                self.slot_freed.notify_waiters();
            }
            Ok(WakeUp::Shutdown) | Err(_) => {}
        }
    }

    async fn spawn_into(
        &self,
        slot_id: u64,
        model_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let result = self.build_instance(model_name, cancel).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(instance) => {
                if state.draining {
                    state.remove_slot(slot_id);
                    drop(state);
                    self.slot_freed.notify_waiters();
                    return Err(GatewayError::ShuttingDown);
                }
                let slot = state.slot_mut(slot_id);
                slot.state = SlotState::Busy {
                    cancel: cancel.clone(),
                };
                slot.last_used = Instant::now();
                state.in_flight += 1;
                Ok(Lease {
                    slot_id,
                    instance: Box::new(instance),
                })
            }
            Err(e) => {
                // Spawn failures leave the slot empty; a later request may
                // retry.
                state.remove_slot(slot_id);
                state.dispatch_capacity(self.config.concurrency);
                drop(state);
                self.slot_freed.notify_waiters();
                Err(e)
            }
        }
    }

    async fn build_instance(
        &self,
        model_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        let model_config = self.config.model(model_name)?.clone();
        let file = self.config.model_file(&model_config);
        self.downloader
            .prepare(&file, model_config.url.as_deref())
            .await?;
        if !file.exists() {
            return Err(GatewayError::Resource(format!(
                "weight file {} still missing after download",
                file.display()
            )));
        }
        Instance::create(
            self.backend.as_ref(),
            model_name,
            &model_config,
            file,
            cancel,
        )
        .await
    }

    async fn finish(&self, lease: Lease, error: Option<&GatewayError>) {
        let fatal =
            error.is_some_and(GatewayError::is_fatal_to_instance) || lease.instance.is_defunct();
        let Lease { slot_id, instance } = lease;
        let mut state = self.state.lock().await;
        state.in_flight -= 1;

        if state.draining || fatal {
            drop(instance);
            state.remove_slot(slot_id);
            if !state.draining {
                state.dispatch_capacity(self.config.concurrency);
            }
            drop(state);
            self.slot_freed.notify_waiters();
            return;
        }
        drop(state);
        self.park_or_dispatch(slot_id, instance).await;
    }

    /// Return an instance to its slot, preferring direct hand-off to a
    /// queued request.
    async fn park_or_dispatch(&self, slot_id: u64, mut instance: Box<Instance>) {
        let mut state = self.state.lock().await;
        loop {
            let slot_model = state.slot_mut(slot_id).model.clone();

            // Oldest waiter for this model gets the warm instance as-is.
            if let Some(pos) = state.waiters.iter().position(|w| w.model == slot_model) {
                let waiter = state.waiters.remove(pos).expect("position valid");
                let cancel = waiter.cancel.clone();
                match waiter.tx.send(WakeUp::Ready { slot_id, instance }) {
                    Ok(()) => {
                        let slot = state.slot_mut(slot_id);
                        slot.state = SlotState::Busy { cancel };
                        slot.last_used = Instant::now();
                        state.in_flight += 1;
                        return;
                    }
                    Err(WakeUp::Ready {
                        instance: returned, ..
                    }) => {
                        instance = returned;
                        continue;
                    }
                    Err(_) => unreachable!("send returns what it was given"),
                }
            }

            // Any other waiter: evict this instance and respawn the slot
            // for the waiter's model.
            if let Some(waiter) = state.waiters.pop_front() {
                info!(old = %slot_model, new = %waiter.model, "evicting instance for queued request");
                drop(instance);
                let cancel = waiter.cancel.clone();
                let slot = state.slot_mut(slot_id);
                slot.model = waiter.model.clone();
                slot.state = SlotState::Loading { cancel };
                if waiter.tx.send(WakeUp::Spawn { slot_id }).is_err() {
                    state.remove_slot(slot_id);
                    state.dispatch_capacity(self.config.concurrency);
                }
                drop(state);
                self.slot_freed.notify_waiters();
                return;
            }

            // No queue: park idle.
            let slot = state.slot_mut(slot_id);
            slot.state = SlotState::Idle(instance);
            slot.last_used = Instant::now();
            drop(state);
            self.slot_freed.notify_waiters();
            return;
        }
    }
}
