//! The per-agent event loop.
//!
//! Two cooperating tasks per agent:
//!
//! - an **ingress task** that decodes inbound wire messages, appends them to
//!   per-sender queues and signals the driver;
//! - the **driver task**, which owns all mutable protocol state, batches the
//!   latest message per sender (older ones are coalesced away unread), runs
//!   the agreement engine, broadcasts when asked to, and watches the
//!   convergence timers.
//!
//! Timers are computed exclusively in the driver task; the ingress side
//! only stamps the arrival instant it observed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agreement::AgreementEngine;
use crate::bidding::{BiddingMessage, Timestamp};
use crate::config::TimeoutConfig;
use crate::error::Result;
use crate::neighborhood::NeighborhoodDetector;
use crate::orchestrator::{DetailedPlacement, Orchestrator, PlacementRecord};
use crate::rap::{AgentId, Rap};
use crate::transport::{Inbox, Transport};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration and report
// ═══════════════════════════════════════════════════════════════════════════════

/// Driver timer settings.
#[derive(Debug, Clone)]
pub struct DriverTimeouts {
    /// Soft quiescence window after neighborhood agreement.
    pub agreement_timeout: Duration,

    /// Permanent silence window; breaks livelock.
    pub weak_agreement_timeout: Duration,

    /// Ceiling on a single dequeue wait.
    pub async_timeout: Duration,

    /// Message-rate bucket width.
    pub sample_frequency: Duration,
}

impl From<&TimeoutConfig> for DriverTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            agreement_timeout: config.agreement_timeout,
            weak_agreement_timeout: config.weak_agreement_timeout,
            async_timeout: config.async_timeout,
            sample_frequency: config.sample_frequency,
        }
    }
}

/// One message-rate bucket: messages sent within `[window_start, window_end)`
/// seconds from run start.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RateSample {
    pub window_start: f64,
    pub window_end: f64,
    pub sent: u64,
}

/// Everything the run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Every neighbor was in the agree set when the run ended.
    pub strong_agreement: bool,

    /// The agreed allocation (possibly empty).
    pub implementation: Vec<PlacementRecord>,

    /// The agreed allocation with per-item utilities.
    pub detailed_implementation: Vec<DetailedPlacement>,

    /// Final private utility.
    pub private_utility: u64,

    /// Send-rate buckets for validation output.
    pub message_rates: Vec<RateSample>,

    pub sent_messages: u64,
    pub received_messages: u64,

    /// Seconds from start to the last state update, if any.
    pub last_update_after: Option<f64>,

    /// Seconds from start to neighborhood agreement, if reached.
    pub agreement_after: Option<f64>,

    /// Total run duration in seconds.
    pub total_time: f64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ingress
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct IngressState {
    per_sender: HashMap<AgentId, Vec<BiddingMessage>>,
    last_message_at: Option<Instant>,
    received: u64,
}

struct IngressQueues {
    state: Mutex<IngressState>,
    notify: Notify,
}

impl IngressQueues {
    fn new() -> Self {
        Self {
            state: Mutex::new(IngressState::default()),
            notify: Notify::new(),
        }
    }

    fn enqueue(&self, message: BiddingMessage) {
        {
            let mut state = self.state.lock();
            state.per_sender.entry(message.sender).or_default().push(message);
            state.last_message_at = Some(Instant::now());
            state.received += 1;
        }
        self.notify.notify_one();
    }

    /// Latest message per sender; everything older is dropped unread.
    fn drain_latest(&self) -> (BTreeMap<AgentId, BiddingMessage>, u64) {
        let mut state = self.state.lock();
        let mut batch = BTreeMap::new();
        let mut coalesced = 0u64;
        for (sender, queue) in state.per_sender.iter_mut() {
            if let Some(latest) = queue.pop() {
                coalesced += queue.len() as u64;
                queue.clear();
                batch.insert(*sender, latest);
            }
        }
        (batch, coalesced)
    }

    fn pending_senders(&self) -> BTreeSet<AgentId> {
        self.state
            .lock()
            .per_sender
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(sender, _)| *sender)
            .collect()
    }

    fn last_message_at(&self) -> Option<Instant> {
        self.state.lock().last_message_at
    }

    fn received(&self) -> u64 {
        self.state.lock().received
    }
}

async fn ingress_loop(
    mut inbox: Inbox,
    queues: Arc<IngressQueues>,
    rap: Arc<Rap>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = inbox.recv() => {
                let Some(wire) = received else { break };
                match BiddingMessage::from_wire(&wire, &rap) {
                    Ok(message) => {
                        counter!("concord_messages_received_total").increment(1);
                        queues.enqueue(message);
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable message");
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate sampling
// ═══════════════════════════════════════════════════════════════════════════════

struct RateSampler {
    begin: Instant,
    width: Duration,
    window_start: Duration,
    in_window: u64,
    samples: Vec<RateSample>,
}

impl RateSampler {
    fn new(begin: Instant, width: Duration) -> Self {
        Self {
            begin,
            width,
            window_start: Duration::ZERO,
            in_window: 0,
            samples: Vec::new(),
        }
    }

    fn record_sends(&mut self, count: u64) {
        self.roll_to(self.begin.elapsed());
        self.in_window += count;
    }

    fn roll_to(&mut self, elapsed: Duration) {
        while elapsed >= self.window_start + self.width {
            let end = self.window_start + self.width;
            self.samples.push(RateSample {
                window_start: self.window_start.as_secs_f64(),
                window_end: end.as_secs_f64(),
                sent: self.in_window,
            });
            self.window_start = end;
            self.in_window = 0;
        }
    }

    fn finish(mut self) -> Vec<RateSample> {
        let elapsed = self.begin.elapsed();
        self.roll_to(elapsed);
        if self.in_window > 0 || self.samples.is_empty() {
            self.samples.push(RateSample {
                window_start: self.window_start.as_secs_f64(),
                window_end: elapsed.as_secs_f64(),
                sent: self.in_window,
            });
        }
        self.samples
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════════════

/// The per-agent protocol loop.
pub struct NodeDriver {
    rap: Arc<Rap>,
    agent: AgentId,
    orchestrator: Orchestrator,
    engine: AgreementEngine,
    detector: NeighborhoodDetector,
    transport: Arc<dyn Transport>,
    timeouts: DriverTimeouts,
    queues: Arc<IngressQueues>,
    sent_messages: u64,
}

impl NodeDriver {
    pub fn new(
        orchestrator: Orchestrator,
        engine: AgreementEngine,
        detector: NeighborhoodDetector,
        transport: Arc<dyn Transport>,
        timeouts: DriverTimeouts,
    ) -> Self {
        let rap = orchestrator.rap().clone();
        let agent = orchestrator.agent();
        Self {
            rap,
            agent,
            orchestrator,
            engine,
            detector,
            transport,
            timeouts,
            queues: Arc::new(IngressQueues::new()),
            sent_messages: 0,
        }
    }

    /// Run the distributed scheduling loop to termination.
    pub async fn run(mut self) -> Result<RunReport> {
        let begin = Instant::now();
        let agent_name = self.rap.agent_name(self.agent).to_string();
        let neighborhood: BTreeSet<AgentId> =
            self.detector.neighborhood().iter().copied().collect();
        info!(
            agent = %agent_name,
            neighbors = neighborhood.len(),
            "starting distributed scheduling"
        );

        let inbox = self.transport.subscribe(&agent_name).await?;
        let cancel = CancellationToken::new();
        // stops the ingress task even when the run exits early on error
        let _cancel_guard = cancel.clone().drop_guard();
        let ingress = tokio::spawn(ingress_loop(
            inbox,
            self.queues.clone(),
            self.rap.clone(),
            cancel.child_token(),
        ));

        let mut sampler = RateSampler::new(begin, self.timeouts.sample_frequency);

        // first bid, then tell the neighborhood
        self.orchestrator.orchestrate();
        self.broadcast(&mut sampler).await?;

        let mut agree_neighbors: BTreeSet<AgentId> = BTreeSet::new();
        let mut agreement_deadline: Option<Instant> = None;
        let mut agreement_at: Option<Instant> = None;
        let mut last_update_at: Option<Instant> = None;

        loop {
            // arm the soft-quiescence timer on fresh neighborhood agreement
            if agree_neighbors.len() == neighborhood.len() && agreement_deadline.is_none() {
                info!(agent = %agent_name, "neighborhood agreement reached");
                agreement_at.get_or_insert_with(Instant::now);
                agreement_deadline = Some(Instant::now() + self.timeouts.agreement_timeout);
            }

            let weak_deadline = self
                .queues
                .last_message_at()
                .unwrap_or(begin)
                + self.timeouts.weak_agreement_timeout;

            let now = Instant::now();
            if now >= weak_deadline {
                info!(agent = %agent_name, "weak agreement timeout, stopping");
                break;
            }
            if let Some(deadline) = agreement_deadline {
                if now >= deadline {
                    info!(agent = %agent_name, "quiescence reached, stopping");
                    break;
                }
            }

            let mut wait_deadline = (now + self.timeouts.async_timeout).min(weak_deadline);
            if let Some(deadline) = agreement_deadline {
                wait_deadline = wait_deadline.min(deadline);
            }
            self.wait_for_batch(&neighborhood, &agree_neighbors, wait_deadline)
                .await;

            let (batch, coalesced) = self.queues.drain_latest();
            if coalesced > 0 {
                counter!("concord_messages_coalesced_total").increment(coalesced);
            }
            if batch.is_empty() {
                continue;
            }
            debug!(agent = %agent_name, batch = batch.len(), coalesced, "processing batch");

            let was_complete = agree_neighbors.len() == neighborhood.len();
            let outcome = self
                .engine
                .multi_agreement(&mut self.orchestrator, &batch, true);

            if outcome.rebroadcast || outcome.overbid {
                self.broadcast(&mut sampler).await?;
            } else {
                debug!(agent = %agent_name, "no rebroadcast needed");
            }

            if outcome.updated {
                last_update_at = Some(Instant::now());
                if was_complete {
                    info!(agent = %agent_name, "previous agreement has been broken");
                    agree_neighbors.clear();
                    agreement_deadline = None;
                }
            }
            for sender in &outcome.per_sender_agreement {
                agree_neighbors.insert(*sender);
            }
            gauge!("concord_agree_neighbors").set(agree_neighbors.len() as f64);
        }

        cancel.cancel();
        let _ = ingress.await;

        let strong_agreement = agree_neighbors.len() == neighborhood.len();
        let report = RunReport {
            strong_agreement,
            implementation: self.orchestrator.implementation.clone(),
            detailed_implementation: self.orchestrator.detailed_implementation.clone(),
            private_utility: self.orchestrator.private_utility,
            message_rates: sampler.finish(),
            sent_messages: self.sent_messages,
            received_messages: self.queues.received(),
            last_update_after: last_update_at.map(|t| (t - begin).as_secs_f64()),
            agreement_after: agreement_at.map(|t| (t - begin).as_secs_f64()),
            total_time: begin.elapsed().as_secs_f64(),
        };
        info!(
            agent = %agent_name,
            strong = report.strong_agreement,
            utility = report.private_utility,
            sent = report.sent_messages,
            received = report.received_messages,
            "agreement process finished"
        );
        Ok(report)
    }

    /// Block until every non-agreed neighbor has a pending message, or the
    /// deadline passes. Returns as soon as a usable batch exists.
    async fn wait_for_batch(
        &self,
        neighborhood: &BTreeSet<AgentId>,
        agree_neighbors: &BTreeSet<AgentId>,
        deadline: Instant,
    ) {
        loop {
            let pending = self.queues.pending_senders();
            if !pending.is_empty() {
                let all_disagreeing_heard = neighborhood
                    .iter()
                    .filter(|n| !agree_neighbors.contains(n))
                    .all(|n| pending.contains(n));
                if all_disagreeing_heard {
                    return;
                }
            }
            if Instant::now() >= deadline {
                return;
            }
            let notified = self.queues.notify.notified();
            if tokio::time::timeout_at(deadline.into(), notified).await.is_err() {
                return;
            }
        }
    }

    /// Send the current (winners, bidding data) to every currently
    /// connected neighbor.
    async fn broadcast(&mut self, sampler: &mut RateSampler) -> Result<()> {
        let message = BiddingMessage {
            sender: self.agent,
            winners: self.orchestrator.per_node_winners.clone(),
            bidding_data: self.orchestrator.bidding_data.clone(),
            timestamp: Timestamp::now(),
        };
        let wire = message.to_wire(&self.rap);

        let current = self.detector.current_neighborhood();
        for neighbor in &current {
            let name = self.rap.agent_name(*neighbor);
            self.transport.send(name, &wire).await?;
            self.sent_messages += 1;
            counter!("concord_messages_sent_total").increment(1);
        }
        sampler.record_sends(current.len() as u64);
        debug!(neighbors = current.len(), "broadcast complete");
        Ok(())
    }
}
