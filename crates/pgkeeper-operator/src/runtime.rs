//! Member event loop
//!
//! Everything runs on one task: leadership transitions, the status tick and
//! the shutdown signal are multiplexed with `select!` and each event is
//! handled to completion before the next one is looked at. Events whose
//! preconditions are not met yet are parked and re-delivered on the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pgkeeper_cluster::{Context, Event, Member, Outcome};
use pgkeeper_common::leader_election::{LeaderElector, LeadershipEvent};
use pgkeeper_common::{Error, Scope};
use pgkeeper_secrets::PeerState;

/// Member-scope peer key holding the version that last ran on this member
pub const VERSION_KEY: &str = "operator-version";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Events waiting for the next tick, without duplicates, in arrival order
#[derive(Debug, Default)]
pub struct PendingEvents {
    events: Vec<Event>,
}

impl PendingEvents {
    /// Park `event` until the next tick
    pub fn defer(&mut self, event: Event) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    /// Drain everything parked so far
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

/// Events that are worth running again after a failure
///
/// The tick re-evaluates status anyway and a stop only happens once.
fn retried_on_error(event: Event) -> bool {
    matches!(
        event,
        Event::LeaderElected | Event::WorkloadReady | Event::Upgrade
    )
}

async fn dispatch(member: &mut Member, event: Event, pending: &mut PendingEvents) {
    match member.handle(event).await {
        Ok(Outcome::Done) => {}
        Ok(Outcome::Retry) => {
            debug!(?event, "preconditions not met, deferring");
            pending.defer(event);
        }
        Err(e) if retried_on_error(event) => {
            warn!(?event, error = %e, "event failed, retrying on next tick");
            pending.defer(event);
        }
        Err(e) => error!(?event, error = %e, "event failed"),
    }
}

/// Whether a different version ran on this member before
///
/// A member that never recorded a version is on its first start, which is
/// not an upgrade.
pub async fn is_upgrade(peers: &dyn PeerState) -> Result<bool, Error> {
    Ok(peers
        .get(Scope::Member, VERSION_KEY)
        .await?
        .is_some_and(|previous| previous != VERSION))
}

/// Remember that this version ran on this member
pub async fn record_version(peers: &dyn PeerState) -> Result<(), Error> {
    peers.set(Scope::Member, VERSION_KEY, VERSION).await
}

/// Long-running member process
pub struct Runtime {
    ctx: Arc<Context>,
    elector: Arc<LeaderElector>,
    tick: Duration,
}

impl Runtime {
    /// Runtime over `ctx`; `elector` must share the context's leader flag
    pub fn new(ctx: Arc<Context>, elector: Arc<LeaderElector>, tick: Duration) -> Self {
        Self {
            ctx,
            elector,
            tick,
        }
    }

    /// Run until SIGTERM or SIGINT, then hand shared objects over and
    /// release the lease
    pub async fn run(self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let election = tokio::spawn(self.elector.clone().run(events_tx));

        let mut member = Member::new(self.ctx.clone());
        let mut pending = PendingEvents::default();

        if is_upgrade(self.ctx.peers.as_ref()).await? {
            info!(version = VERSION, "new operator version on this member");
            dispatch(&mut member, Event::Upgrade, &mut pending).await;
        }
        record_version(self.ctx.peers.as_ref()).await?;
        dispatch(&mut member, Event::WorkloadReady, &mut pending).await;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            member = %self.ctx.identity.member_name(),
            tick_secs = self.tick.as_secs(),
            "member runtime started"
        );

        loop {
            tokio::select! {
                Some(transition) = events_rx.recv() => match transition {
                    LeadershipEvent::Acquired => {
                        dispatch(&mut member, Event::LeaderElected, &mut pending).await;
                    }
                    LeadershipEvent::Lost => info!("leadership lost"),
                },
                _ = ticker.tick() => {
                    for event in pending.take() {
                        dispatch(&mut member, event, &mut pending).await;
                    }
                    dispatch(&mut member, Event::UpdateStatus, &mut pending).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    break;
                }
            }
        }

        dispatch(&mut member, Event::Stop, &mut pending).await;
        election.abort();
        if let Err(e) = self.elector.release().await {
            warn!(error = %e, "failed to release leader lease");
        }
        info!("member runtime stopped");
        Ok(())
    }
}
