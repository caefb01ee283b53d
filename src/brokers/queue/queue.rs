//! Queue: two ordered lists (priority, regular), the consumers attached to
//! them, the active state and the delivery pipeline every state sends through.
//!
//! Lock order is `dispatch` -> `state`. Message lists and the consumer set have
//! their own short-lived locks and are never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::brokers::queue::codec::MessageCodec;
use crate::brokers::queue::consumer::ConsumerSink;
use crate::brokers::queue::decision::{self, Decision, PutBack, Transmission};
use crate::brokers::queue::delivery::{DeliveryTracker, InFlight};
use crate::brokers::queue::handler::{catch_hook, DeliveryHandler, Hook, QueueInfo};
use crate::brokers::queue::message::{Message, MessageDelivery, QueueMessage};
use crate::brokers::queue::options::{AutoDestroy, OverflowStrategy, QueueOptions, QueueStatus};
use crate::brokers::queue::states::{
    ClearAfter, DispatchOutcome, EnterResult, PullOrder, PullRequest, PullResult, PushResult, QueueState,
};
use crate::brokers::queue::stats::{QueueStats, StatsSnapshot};
use crate::brokers::queue::sweeper::Sweeper;
use crate::error::QueueError;
use crate::utils::current_time_ms;

/// How the send pipeline treats a message once the consumers have been tried.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendMode {
    /// Register the delivery for acknowledgement (when the queue asks for acks).
    pub track_ack: bool,
    /// Honour a put-back decision.
    pub put_back: bool,
    /// Kick the drain loop after a put-back.
    pub retrigger: bool,
}

impl SendMode {
    pub const DISPATCH: SendMode = SendMode { track_ack: true, put_back: true, retrigger: false };
    pub const PULL: SendMode = SendMode { track_ack: true, put_back: true, retrigger: false };
    pub const BROADCAST: SendMode = SendMode { track_ack: false, put_back: false, retrigger: false };
    pub const RESOLVED: SendMode = SendMode { track_ack: false, put_back: true, retrigger: true };
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Ack(bool),
    Timeout,
}

/// Read-only view of a queued message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageInfo {
    pub id: String,
    pub high_priority: bool,
    pub delivery_count: u32,
    pub send_count: u32,
    pub deadline: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub status: QueueStatus,
    pub options: QueueOptions,
    pub durable: bool,
    pub consumers: usize,
    pub priority_messages: usize,
    pub regular_messages: usize,
    pub in_flight: usize,
    pub stats: StatsSnapshot,
    pub created_at: u64,
}

pub struct Queue {
    name: String,
    me: Weak<Queue>,
    options: RwLock<QueueOptions>,
    status: RwLock<QueueStatus>,
    state: tokio::sync::RwLock<Arc<QueueState>>,
    dispatch: tokio::sync::Mutex<()>,
    transitions: AtomicUsize,
    epoch: watch::Sender<u64>,
    priority_messages: Mutex<VecDeque<QueueMessage>>,
    regular_messages: Mutex<VecDeque<QueueMessage>>,
    consumers: RwLock<Vec<Arc<dyn ConsumerSink>>>,
    handler: Arc<dyn DeliveryHandler>,
    codec: Arc<dyn MessageCodec>,
    deliveries: DeliveryTracker,
    stats: QueueStats,
    sweeper: Sweeper,
    closed: AtomicBool,
    idle_since: Mutex<Option<u64>>,
    created_at: u64,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        handler: Arc<dyn DeliveryHandler>,
        codec: Arc<dyn MessageCodec>,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let status = options.status;
        let (epoch, _) = watch::channel(0u64);
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            me: me.clone(),
            options: RwLock::new(options),
            status: RwLock::new(status),
            state: tokio::sync::RwLock::new(Arc::new(QueueState::for_status(status))),
            dispatch: tokio::sync::Mutex::new(()),
            transitions: AtomicUsize::new(0),
            epoch,
            priority_messages: Mutex::new(VecDeque::new()),
            regular_messages: Mutex::new(VecDeque::new()),
            consumers: RwLock::new(Vec::new()),
            handler,
            codec,
            deliveries: DeliveryTracker::new(),
            stats: QueueStats::default(),
            sweeper: Sweeper::new(sweep_interval),
            closed: AtomicBool::new(false),
            idle_since: Mutex::new(None),
            created_at: current_time_ms(),
        })
    }

    /// Validates the configuration, lets the handler restore its messages and starts the sweeper.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), QueueError> {
        let options = self.options();
        options.validate()?;

        let info = QueueInfo { name: self.name.clone(), options: options.clone() };
        let mut restored = self.handler.initialize(&info).await?;

        if options.status == QueueStatus::Cache && restored.len() > 1 {
            let stale: Vec<QueueMessage> = restored.drain(..restored.len() - 1).collect();
            for message in &stale {
                self.remove_message(message).await;
            }
        }

        let count = restored.len();
        for message in restored {
            self.enqueue(message);
        }
        if count > 0 {
            info!("Queue '{}': restored {} messages", self.name, count);
        }

        if options.status != QueueStatus::Stopped {
            self.start_sweeper();
        }
        Ok(())
    }

    // ==========================================
    // ACCESSORS
    // ==========================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> QueueOptions {
        self.options.read().clone()
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.read()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn handler(&self) -> &Arc<dyn DeliveryHandler> {
        &self.handler
    }

    pub fn is_durable(&self) -> bool {
        self.handler.store().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> usize {
        self.priority_messages.lock().len() + self.regular_messages.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.deliveries.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().iter().filter(|c| c.is_connected()).count()
    }

    /// Queued messages, priority list first.
    pub fn messages(&self) -> Vec<MessageInfo> {
        let view = |m: &QueueMessage| MessageInfo {
            id: m.message.id.clone(),
            high_priority: m.is_high_priority(),
            delivery_count: m.delivery_count,
            send_count: m.send_count,
            deadline: m.deadline,
        };
        let mut out: Vec<MessageInfo> = self.priority_messages.lock().iter().map(view).collect();
        out.extend(self.regular_messages.lock().iter().map(view));
        out
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name.clone(),
            status: self.status(),
            options: self.options(),
            durable: self.is_durable(),
            consumers: self.consumer_count(),
            priority_messages: self.priority_messages.lock().len(),
            regular_messages: self.regular_messages.lock().len(),
            in_flight: self.deliveries.len(),
            stats: self.stats.snapshot(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn handle(&self) -> Option<Arc<Queue>> {
        self.me.upgrade()
    }

    pub(crate) fn deliveries(&self) -> &DeliveryTracker {
        &self.deliveries
    }

    // ==========================================
    // CONSUMERS
    // ==========================================

    pub fn subscribe(&self, consumer: Arc<dyn ConsumerSink>) -> Result<(), QueueError> {
        {
            let mut consumers = self.consumers.write();
            consumers.retain(|c| c.is_connected() && c.id() != consumer.id());
            let limit = self.options.read().client_limit;
            if limit > 0 && consumers.len() >= limit {
                return Err(QueueError::ClientLimitExceeded(limit));
            }
            debug!("Queue '{}': consumer '{}' subscribed", self.name, consumer.id());
            consumers.push(consumer);
        }
        *self.idle_since.lock() = None;
        self.spawn_trigger();
        Ok(())
    }

    pub fn unsubscribe(&self, consumer_id: &str) -> bool {
        let mut consumers = self.consumers.write();
        let before = consumers.len();
        consumers.retain(|c| c.id() != consumer_id);
        before != consumers.len()
    }

    pub(crate) fn connected_consumers(&self) -> Vec<Arc<dyn ConsumerSink>> {
        self.consumers.read().iter().filter(|c| c.is_connected()).cloned().collect()
    }

    pub(crate) fn find_consumer(&self, consumer_id: &str) -> Option<Arc<dyn ConsumerSink>> {
        self.consumers
            .read()
            .iter()
            .find(|c| c.id() == consumer_id && c.is_connected())
            .cloned()
    }

    // ==========================================
    // LISTS
    // ==========================================

    pub(crate) fn enqueue(&self, mut message: QueueMessage) {
        message.is_in_queue = true;
        if message.is_high_priority() {
            self.priority_messages.lock().push_back(message);
        } else {
            self.regular_messages.lock().push_back(message);
        }
    }

    fn requeue(&self, mut message: QueueMessage, put_back: PutBack) {
        message.is_in_queue = true;
        match put_back {
            PutBack::End => self.regular_messages.lock().push_back(message),
            _ => self.enqueue(message),
        }
    }

    /// Priority list first. `Lifo` takes from the tail of each list.
    pub(crate) fn dequeue(&self, order: PullOrder) -> Option<QueueMessage> {
        let take = |list: &Mutex<VecDeque<QueueMessage>>| {
            let mut list = list.lock();
            match order {
                PullOrder::Fifo => list.pop_front(),
                PullOrder::Lifo => list.pop_back(),
            }
        };
        let mut message = take(&self.priority_messages).or_else(|| take(&self.regular_messages))?;
        message.is_in_queue = false;
        Some(message)
    }

    /// Replaces the whole backlog with one message, returning what was there.
    pub(crate) fn replace_backlog(&self, message: QueueMessage) -> Vec<QueueMessage> {
        let mut previous: Vec<QueueMessage> = self.priority_messages.lock().drain(..).collect();
        {
            let mut regular = self.regular_messages.lock();
            previous.extend(regular.drain(..));
            let mut message = message;
            message.is_in_queue = true;
            regular.push_back(message);
        }
        for message in previous.iter_mut() {
            message.is_in_queue = false;
        }
        previous
    }

    /// Keeps only the most recently created message.
    pub(crate) fn trim_to_latest(&self) -> Vec<QueueMessage> {
        let mut all: Vec<QueueMessage> = self.priority_messages.lock().drain(..).collect();
        all.extend(self.regular_messages.lock().drain(..));
        let Some(latest) = all
            .iter()
            .enumerate()
            .max_by_key(|(i, m)| (m.message.created_at, *i))
            .map(|(i, _)| i)
        else {
            return Vec::new();
        };
        let keep = all.remove(latest);
        self.regular_messages.lock().push_back(keep);
        for message in all.iter_mut() {
            message.is_in_queue = false;
        }
        all
    }

    pub(crate) fn peek_latest(&self) -> Option<Message> {
        self.regular_messages
            .lock()
            .back()
            .map(|m| m.message.clone())
            .or_else(|| self.priority_messages.lock().back().map(|m| m.message.clone()))
    }

    fn drain_lists(&self, scope: ClearAfter) -> Vec<QueueMessage> {
        let mut drained = Vec::new();
        if matches!(scope, ClearAfter::Priority | ClearAfter::All) {
            drained.extend(self.priority_messages.lock().drain(..));
        }
        if matches!(scope, ClearAfter::Regular | ClearAfter::All) {
            drained.extend(self.regular_messages.lock().drain(..));
        }
        for message in drained.iter_mut() {
            message.is_in_queue = false;
            message.notify_producer(Transmission::Failed);
        }
        drained
    }

    /// Removes queued messages one by one through the handler. In-flight messages are untouched.
    pub(crate) async fn clear_backlog(&self, scope: ClearAfter) -> usize {
        let drained = self.drain_lists(scope);
        for message in &drained {
            self.remove_message(message).await;
        }
        drained.len()
    }

    /// Drops the backlog and every tracked delivery, then tells the handler once.
    pub(crate) async fn purge(&self) -> usize {
        let mut dropped = self.drain_lists(ClearAfter::All);
        dropped.extend(self.deliveries.reset());
        for message in dropped.iter_mut() {
            message.notify_producer(Transmission::Failed);
        }
        if let Err(e) = catch_hook(self.handler.queue_cleared()).await {
            self.fault(Hook::QueueCleared, None, e).await;
        }
        dropped.len()
    }

    fn take_expired(&self, now: u64) -> Vec<QueueMessage> {
        let mut expired = Vec::new();
        for list in [&self.priority_messages, &self.regular_messages] {
            let mut list = list.lock();
            if !list.iter().any(|m| m.is_expired(now)) {
                continue;
            }
            let (dead, alive): (VecDeque<QueueMessage>, VecDeque<QueueMessage>) =
                list.drain(..).partition(|m| m.is_expired(now));
            *list = alive;
            expired.extend(dead.into_iter().map(|mut m| {
                m.is_in_queue = false;
                m
            }));
        }
        expired
    }

    // ==========================================
    // HOOK PLUMBING
    // ==========================================

    async fn fault(&self, hook: Hook, message: Option<&QueueMessage>, err: anyhow::Error) -> Decision {
        self.stats.error();
        error!("Queue '{}': handler {:?} failed: {:#}", self.name, hook, err);
        let handled = catch_hook(async { Ok(self.handler.exception_thrown(hook, message, &err).await) }).await;
        match handled {
            Ok(decision) => decision,
            Err(e) => {
                error!("Queue '{}': exception handler failed: {:#}", self.name, e);
                Decision::allow()
            }
        }
    }

    async fn decide(&self, hook: Hook, result: anyhow::Result<Decision>, message: Option<&QueueMessage>) -> Decision {
        match result {
            Ok(decision) => decision,
            Err(e) => self.fault(hook, message, e).await,
        }
    }

    pub(crate) async fn remove_message(&self, message: &QueueMessage) {
        if let Err(e) = catch_hook(self.handler.message_removed(message)).await {
            self.fault(Hook::MessageRemoved, Some(message), e).await;
        }
    }

    // ==========================================
    // PRODUCER SIDE
    // ==========================================

    pub async fn push(&self, message: Message) -> PushResult {
        self.push_message(QueueMessage::new(message)).await
    }

    /// Like `push`, plus a receiver resolved with the producer-facing outcome.
    pub async fn push_tracked(&self, message: Message) -> (PushResult, oneshot::Receiver<Transmission>) {
        let (tx, rx) = oneshot::channel();
        let mut message = QueueMessage::new(message);
        message.attach_producer(tx);
        (self.push_message(message).await, rx)
    }

    async fn push_message(&self, mut message: QueueMessage) -> PushResult {
        if self.is_closed() {
            message.notify_producer(Transmission::Failed);
            return PushResult::StatusNotSupported;
        }

        let (result, status) = {
            let state_guard = self.state.read().await;
            let state = state_guard.clone();

            if !state.can_enqueue(self, &message) {
                message.notify_producer(Transmission::Failed);
                return state.reject_reason();
            }
            // A cache update replaces its slot, so it never grows the backlog.
            if state.status() != QueueStatus::Cache {
                if let Err(rejected) = self.enforce_limit().await {
                    message.notify_producer(Transmission::Failed);
                    return rejected;
                }
            }

            self.stats.received();
            let timeout = self.options.read().message_timeout_ms;
            if timeout > 0 {
                message.deadline = Some(current_time_ms() + timeout);
            }

            let result = catch_hook(self.handler.received_from_producer(&mut message)).await;
            let decision = self.decide(Hook::ReceivedFromProducer, result, Some(&message)).await;
            message.decision = decision;
            if decision.save {
                message.is_saved = true;
            }
            if !decision.allow {
                message.notify_producer(Transmission::Failed);
                return PushResult::Rejected;
            }
            message.notify_producer(decision.transmission);

            (state.accept(self, message).await, state.status())
        };

        *self.idle_since.lock() = None;
        if result == PushResult::Success && matches!(status, QueueStatus::Push | QueueStatus::RoundRobin) {
            // Under ack-wait this parks the producer until the previous delivery resolves.
            self.trigger().await;
        }
        result
    }

    async fn enforce_limit(&self) -> Result<(), PushResult> {
        let (limit, overflow) = {
            let options = self.options.read();
            (options.message_limit, options.overflow)
        };
        if limit == 0 || self.message_count() < limit {
            return Ok(());
        }

        match overflow {
            OverflowStrategy::RejectNew => Err(PushResult::LimitExceeded),
            OverflowStrategy::DeleteOldest => {
                let oldest = self
                    .regular_messages
                    .lock()
                    .pop_front()
                    .or_else(|| self.priority_messages.lock().pop_front());
                if let Some(mut oldest) = oldest {
                    oldest.is_in_queue = false;
                    oldest.notify_producer(Transmission::Failed);
                    debug!("Queue '{}': limit reached, dropping oldest '{}'", self.name, oldest.id());
                    self.remove_message(&oldest).await;
                }
                Ok(())
            }
        }
    }

    // ==========================================
    // DRAIN LOOP
    // ==========================================

    /// Drains the backlog through the active state until it runs dry or cannot deliver.
    pub(crate) async fn trigger(&self) {
        let _dispatch = self.dispatch.lock().await;
        loop {
            if self.is_closed() || self.transitions.load(Ordering::SeqCst) > 0 {
                break;
            }
            let state = self.state.read().await.clone();
            if !state.status().is_dispatching() || self.message_count() == 0 {
                break;
            }

            let wait_ack = self.options.read().waits_for_ack();
            if wait_ack && state.gates_on_ack() && !self.wait_for_ack_gate().await {
                continue;
            }

            match state.dispatch_next(self).await {
                DispatchOutcome::Delivered => {
                    let delay = self.options.read().delay_between_messages_ms;
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                DispatchOutcome::Idle => break,
            }
        }
    }

    /// Waits until nothing is in flight. `false` when a status change or close interrupted the wait.
    async fn wait_for_ack_gate(&self) -> bool {
        let mut epoch = self.epoch.subscribe();
        let mut pending = self.deliveries.subscribe();
        loop {
            if self.is_closed() || self.transitions.load(Ordering::SeqCst) > 0 {
                return false;
            }
            if *pending.borrow_and_update() == 0 {
                return true;
            }
            tokio::select! {
                changed = pending.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = epoch.changed() => return false,
            }
        }
    }

    pub(crate) fn spawn_trigger(&self) {
        if !self.status().is_dispatching() {
            return;
        }
        if let Some(queue) = self.handle() {
            tokio::spawn(async move {
                queue.trigger().await;
            });
        }
    }

    // ==========================================
    // SEND PIPELINE
    // ==========================================

    /// Runs one message through the send hooks to `targets`. Returns how many consumers got it.
    pub(crate) async fn send_to(
        &self,
        mut message: QueueMessage,
        targets: Vec<Arc<dyn ConsumerSink>>,
        mode: SendMode,
    ) -> usize {
        message.is_in_queue = false;
        if let Err(e) = catch_hook(self.handler.message_dequeued(&message)).await {
            self.fault(Hook::MessageDequeued, Some(&message), e).await;
        }

        let result = catch_hook(self.handler.begin_send(&mut message)).await;
        let begin = self.decide(Hook::BeginSend, result, Some(&message)).await;
        if !begin.allow {
            self.apply_decision(message, begin, mode).await;
            return 0;
        }
        message.delivery_count += 1;

        let payload = match self.codec.encode(&message.message) {
            Ok(payload) => payload,
            Err(e) => {
                let decision = self.fault(Hook::Encode, Some(&message), e).await;
                self.apply_decision(message, decision, mode).await;
                return 0;
            }
        };

        let options = self.options();
        let track = mode.track_ack && options.acknowledge.requires_ack();
        let ack_deadline = track.then(|| current_time_ms() + options.acknowledge_timeout_ms);
        let message_id = message.id().to_string();
        let mut inflight = if track { self.deliveries.begin(&message_id) } else { None };
        if track && inflight.is_none() {
            warn!(
                "Queue '{}': message '{}' is already in flight, sending without ack tracking",
                self.name, message_id
            );
        }

        let outcomes = self.send_all(&message, &targets, &payload, ack_deadline).await;

        let mut decision = decision::fold(outcomes.iter().map(|(_, d)| *d));
        let sent: Vec<MessageDelivery> = outcomes.into_iter().map(|(d, _)| d).filter(|d| d.is_sent).collect();
        let delivered = sent.len();
        message.send_count += delivered as u32;
        self.stats.sent(delivered as u64);
        message.current_delivery_receivers = sent.iter().map(|d| d.consumer_id.clone()).collect();

        let result = catch_hook(self.handler.end_send(&mut message)).await;
        decision = decision.merge(self.decide(Hook::EndSend, result, Some(&message)).await);

        match inflight.take() {
            Some(mut entry) if delivered > 0 => {
                message.notify_producer(decision.transmission);
                message.decision = decision;
                for delivery in &sent {
                    self.deliveries.mark_busy(&delivery.consumer_id);
                }
                *entry = InFlight {
                    message: Some(message),
                    deliveries: sent,
                    decision: Decision::allow(),
                    finished: false,
                };
            }
            other => {
                if other.is_some() {
                    drop(other);
                    self.deliveries.remove(&message_id);
                }
                if !track {
                    message.current_delivery_receivers.clear();
                }
                self.apply_decision(message, decision, mode).await;
            }
        }
        delivered
    }

    /// Sends to every target concurrently.
    async fn send_all(
        &self,
        message: &QueueMessage,
        targets: &[Arc<dyn ConsumerSink>],
        payload: &Bytes,
        ack_deadline: Option<u64>,
    ) -> Vec<(MessageDelivery, Decision)> {
        let sends = targets.iter().map(|consumer| async move {
            let consumer_id = consumer.id().to_string();
            let allowed = match catch_hook(self.handler.can_consumer_receive(message, &consumer_id)).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    self.fault(Hook::CanConsumerReceive, Some(message), e).await;
                    false
                }
            };
            if !allowed || !consumer.is_connected() {
                return None;
            }

            let mut delivery = MessageDelivery::new(message.id(), &consumer_id, ack_deadline);
            let (hook, result) = match consumer.send(payload.clone()).await {
                Ok(()) => {
                    delivery.is_sent = true;
                    let result = catch_hook(self.handler.consumer_received(message, &delivery)).await;
                    (Hook::ConsumerReceived, result)
                }
                Err(e) => {
                    debug!("Queue '{}': send to '{}' failed: {:#}", self.name, consumer_id, e);
                    let result = catch_hook(self.handler.consumer_receive_failed(message, &delivery)).await;
                    (Hook::ConsumerReceiveFailed, result)
                }
            };
            let decision = self.decide(hook, result, Some(message)).await;
            Some((delivery, decision))
        });

        join_all(sends).await.into_iter().flatten().collect()
    }

    /// Sends a copy of `message` without taking it out of the queue.
    pub(crate) async fn send_snapshot(&self, message: &Message, consumer: &Arc<dyn ConsumerSink>) -> bool {
        let snapshot = QueueMessage::new(message.clone());
        let payload = match self.codec.encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                self.fault(Hook::Encode, Some(&snapshot), e).await;
                return false;
            }
        };
        let outcomes = self.send_all(&snapshot, std::slice::from_ref(consumer), &payload, None).await;
        let sent = outcomes.iter().filter(|(d, _)| d.is_sent).count();
        self.stats.sent(sent as u64);
        sent > 0
    }

    /// Final step for a message leaving the pipeline: report, then requeue or drop.
    pub(crate) async fn apply_decision(&self, mut message: QueueMessage, decision: Decision, mode: SendMode) {
        message.notify_producer(decision.transmission);
        message.decision = decision;

        if self.is_closed() {
            return;
        }

        // `keep` only spares the stored copy when the requested put-back actually happens.
        let overridden = (!mode.put_back || self.status() == QueueStatus::Stopped) && decision.put_back != PutBack::No;
        let put_back = if overridden { PutBack::No } else { decision.put_back };
        if put_back == PutBack::No {
            if !decision.keep || overridden {
                self.remove_message(&message).await;
            }
            return;
        }

        message.current_delivery_receivers.clear();
        message.deadline = None;

        let delay = self.options.read().put_back_delay_ms;
        if delay > 0 {
            if let Some(queue) = self.handle() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if queue.is_closed() || queue.status() == QueueStatus::Stopped {
                        return;
                    }
                    queue.requeue(message, put_back);
                    queue.spawn_trigger();
                });
            }
            return;
        }

        self.requeue(message, put_back);
        if mode.retrigger {
            self.spawn_trigger();
        }
    }

    // ==========================================
    // CONSUMER SIDE
    // ==========================================

    pub async fn pull(&self, consumer_id: &str, request: PullRequest) -> PullResult {
        if self.is_closed() || !matches!(self.status(), QueueStatus::Pull | QueueStatus::Cache) {
            return PullResult::StatusNotSupported;
        }
        let _dispatch = self.dispatch.lock().await;
        let state = self.state.read().await.clone();
        state.pull(self, consumer_id, request).await
    }

    /// Acknowledges (or, with `success == false`, negatively acknowledges) a delivery.
    /// Returns `false` when no such delivery is pending.
    pub async fn acknowledge(&self, consumer_id: &str, message_id: &str, success: bool) -> bool {
        self.resolve_delivery(message_id, consumer_id, Resolution::Ack(success)).await
    }

    async fn resolve_delivery(&self, message_id: &str, consumer_id: &str, resolution: Resolution) -> bool {
        let Some(entry) = self.deliveries.get(message_id) else {
            return false;
        };
        let mut guard = entry.lock().await;
        if guard.finished {
            return false;
        }

        let InFlight { message, deliveries, decision, .. } = &mut *guard;
        let now = current_time_ms();
        let Some(delivery) = deliveries
            .iter_mut()
            .find(|d| d.consumer_id == consumer_id && !d.is_resolved())
        else {
            return false;
        };
        match resolution {
            Resolution::Ack(_) => delivery.is_acknowledged = true,
            Resolution::Timeout => {
                if !delivery.is_expired(now) {
                    return false;
                }
                delivery.is_timed_out = true;
            }
        }
        let delivery = delivery.clone();
        self.deliveries.release(consumer_id);

        let Some(held) = message.as_mut() else {
            return false;
        };
        held.current_delivery_receivers.retain(|c| c != consumer_id);

        let outcome = match resolution {
            Resolution::Ack(success) => {
                self.stats.acknowledged(success);
                let result = catch_hook(self.handler.acknowledge_received(held, &delivery, success)).await;
                self.decide(Hook::AcknowledgeReceived, result, Some(&*held)).await
            }
            Resolution::Timeout => {
                self.stats.ack_timed_out();
                debug!(
                    "Queue '{}': ack for '{}' from '{}' timed out",
                    self.name, message_id, consumer_id
                );
                let result = catch_hook(self.handler.acknowledge_timed_out(held, &delivery)).await;
                self.decide(Hook::AcknowledgeTimedOut, result, Some(&*held)).await
            }
        };
        *decision = decision.merge(outcome);

        if !guard.all_resolved() {
            return true;
        }

        guard.finished = true;
        let released = guard.message.take();
        let final_decision = guard.decision;
        drop(guard);
        self.deliveries.remove(message_id);

        if let Some(released) = released {
            self.apply_decision(released, final_decision, SendMode::RESOLVED).await;
        }
        if self.message_count() > 0 {
            self.spawn_trigger();
        }
        true
    }

    // ==========================================
    // SWEEPER
    // ==========================================

    pub(crate) fn start_sweeper(&self) {
        if !self.is_closed() {
            self.sweeper.start(self.me.clone());
        }
    }

    pub(crate) fn stop_sweeper(&self) {
        self.sweeper.stop();
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }

    /// One timeout pass: expired acknowledgements first, then expired queued messages.
    pub async fn sweep(&self) {
        let now = current_time_ms();

        for (message_id, consumer_id) in self.deliveries.expired(now) {
            self.resolve_delivery(&message_id, &consumer_id, Resolution::Timeout).await;
        }

        for mut message in self.take_expired(now) {
            self.stats.message_timed_out();
            debug!("Queue '{}': message '{}' expired in queue", self.name, message.id());
            let result = catch_hook(self.handler.message_timed_out(&mut message)).await;
            let decision = self.decide(Hook::MessageTimedOut, result, Some(&message)).await;
            self.apply_decision(message, decision, SendMode::RESOLVED).await;
        }
    }

    // ==========================================
    // ADMIN
    // ==========================================

    /// Swaps the active state. Returns the previous status.
    pub async fn set_status(&self, next: QueueStatus) -> Result<QueueStatus, QueueError> {
        if self.is_closed() {
            return Err(QueueError::NotFound(self.name.clone()));
        }
        if self.status() == next {
            return Ok(next);
        }

        self.transitions.fetch_add(1, Ordering::SeqCst);
        self.epoch.send_modify(|epoch| *epoch += 1);

        let outcome = {
            let _dispatch = self.dispatch.lock().await;
            let mut state = self.state.write().await;
            let previous = state.status();
            if previous == next {
                None
            } else {
                state.leave(self, next).await;
                let entered = Arc::new(QueueState::for_status(next));
                *state = entered.clone();
                *self.status.write() = next;
                self.options.write().status = next;
                let enter = entered.enter(self, previous).await;
                info!("Queue '{}': status {} -> {}", self.name, previous, next);
                Some((previous, enter))
            }
        };

        self.transitions.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            None => {
                // A concurrent swap got here first; the interrupted drain still needs a restart.
                self.spawn_trigger();
                Ok(next)
            }
            Some((previous, enter)) => {
                if enter == EnterResult::AllowAndTrigger {
                    self.spawn_trigger();
                }
                Ok(previous)
            }
        }
    }

    /// Applies new options. A different status goes through `set_status`.
    pub async fn set_options(&self, options: QueueOptions) -> Result<(), QueueError> {
        options.validate()?;
        let next_status = options.status;
        {
            let mut current = self.options.write();
            let status = current.status;
            *current = options;
            current.status = status;
        }
        if next_status != self.status() {
            self.set_status(next_status).await?;
        } else {
            self.spawn_trigger();
        }
        Ok(())
    }

    /// Removes every queued message. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let dropped = self.clear_backlog(ClearAfter::All).await;
        if dropped > 0 {
            info!("Queue '{}': cleared {} messages", self.name, dropped);
        }
        dropped
    }

    /// Durable content, or the in-memory backlog for a non-durable queue.
    pub async fn sync_snapshot(&self) -> Vec<Message> {
        match self.handler.store() {
            Some(store) => store.list().await,
            None => {
                let mut out: Vec<Message> = self.priority_messages.lock().iter().map(|m| m.message.clone()).collect();
                out.extend(self.regular_messages.lock().iter().map(|m| m.message.clone()));
                out
            }
        }
    }

    /// Tracks idleness for auto-destroy. `true` once the grace period has passed.
    pub(crate) fn auto_destroy_due(&self, now: u64) -> bool {
        let (policy, idle_ms) = {
            let options = self.options.read();
            (options.auto_destroy, options.auto_destroy_idle_ms)
        };
        let no_consumers = || self.consumer_count() == 0;
        let no_messages = || self.message_count() == 0 && self.deliveries.is_empty();
        let idle = match policy {
            AutoDestroy::Disabled => false,
            AutoDestroy::NoConsumers => no_consumers(),
            AutoDestroy::NoMessages => no_messages(),
            AutoDestroy::Empty => no_consumers() && no_messages(),
        };

        let mut since = self.idle_since.lock();
        if !idle {
            *since = None;
            return false;
        }
        let start = *since.get_or_insert(now);
        now.saturating_sub(start) >= idle_ms
    }

    /// Stops background work and shuts the handler down. `destroy` also removes durable files.
    pub async fn close(&self, destroy: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sweeper.stop();
        self.epoch.send_modify(|epoch| *epoch += 1);

        let _dispatch = self.dispatch.lock().await;
        for mut message in self.deliveries.reset() {
            message.notify_producer(Transmission::Failed);
        }
        if let Err(e) = catch_hook(self.handler.shutdown(destroy)).await {
            error!("Queue '{}': handler shutdown failed: {:#}", self.name, e);
        }
        info!("Queue '{}': closed{}", self.name, if destroy { " and destroyed" } else { "" });
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.sweeper.stop();
    }
}
