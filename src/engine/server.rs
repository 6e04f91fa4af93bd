// Match server: runs one arena on a dedicated thread and broadcasts frames to subscribers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::metrics;

use super::agent::Agent;
use super::arena::{Arena, ArenaError, ArenaSnapshot, DisplaySize, Ranking};
use super::config::{ArenaConfig, SchedulerConfig};
use super::loader::{Loader, LoaderConfig, LoaderError};

/// Messages sent from the match loop to WebSocket clients.
#[derive(Clone, Serialize, Debug)]
#[serde(tag = "type")]
pub enum ArenaMessage {
    /// Per-tick arena state.
    #[serde(rename = "frame")]
    Frame(ArenaSnapshot),
    /// A submission was excluded because it failed to load.
    #[serde(rename = "load_error")]
    LoadError {
        agent: String,
        kind: String,
        error: String,
    },
    /// The arena could not be built.
    #[serde(rename = "match_error")]
    MatchError { error: String },
    /// The match has ended.
    #[serde(rename = "ranking")]
    Ranking { standings: Vec<String>, cycles: u64 },
}

/// One competitor handed to the match server.
#[derive(Debug, Clone)]
pub struct Entrant {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("a match is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("match panicked: {0}")]
    Panicked(String),
}

/// Static parameters shared by every match this server runs.
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub arena: ArenaConfig,
    pub scheduler: SchedulerConfig,
    pub loader: LoaderConfig,
    /// Stop after this many cycles even without a winner.
    pub max_cycles: Option<u64>,
}

/// Result of a headless match.
#[derive(Debug)]
pub struct MatchOutcome {
    /// `None` when the cycle bound was reached first.
    pub ranking: Option<Ranking>,
    pub cycles: u64,
    pub load_errors: Vec<LoaderError>,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Load every entrant, reporting failures through `on_error`. Failed entrants are skipped.
fn load_entrants(
    loader: &Loader,
    entrants: &[Entrant],
    mut on_error: impl FnMut(LoaderError),
) -> Vec<Agent> {
    let mut agents = Vec::with_capacity(entrants.len());
    for entry in entrants {
        match loader.load(&entry.name, &entry.source) {
            Ok(agent) => agents.push(agent),
            Err(e) => {
                tracing::error!(agent = %entry.name, kind = e.kind(), "Failed to load agent: {e}");
                metrics::LOAD_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
                on_error(e);
            }
        }
    }
    agents
}

/// Run a match headless (no broadcast, no per-tick sleep) on the calling thread.
pub fn run_match_headless(
    entrants: Vec<Entrant>,
    display: DisplaySize,
    options: &MatchOptions,
    max_cycles: u64,
) -> Result<MatchOutcome, MatchError> {
    metrics::MATCHES_STARTED_TOTAL.inc();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| -> Result<MatchOutcome, MatchError> {
        let loader = Loader::new(options.loader.clone());
        let mut load_errors = Vec::new();
        let agents = load_entrants(&loader, &entrants, |e| load_errors.push(e));
        let mut arena = Arena::new(agents, display, options.arena.clone())?;

        let mut cycles = 0;
        let mut ranking = None;
        while cycles < max_cycles {
            cycles += 1;
            if let Some(r) = arena.run_cycle() {
                ranking = Some(r);
                break;
            }
        }
        Ok(MatchOutcome {
            ranking,
            cycles,
            load_errors,
        })
    }));

    match result {
        Ok(Ok(outcome)) => {
            metrics::MATCHES_COMPLETED_TOTAL.inc();
            Ok(outcome)
        }
        Ok(Err(e)) => {
            metrics::MATCHES_ERRORED_TOTAL.inc();
            Err(e)
        }
        Err(payload) => {
            let msg = panic_message(payload);
            tracing::error!("Headless match panicked: {}", msg);
            metrics::MATCHES_ERRORED_TOTAL.inc();
            Err(MatchError::Panicked(msg))
        }
    }
}

/// Callback invoked on the match thread with the final ranking.
pub type WinHandler = Box<dyn FnOnce(Ranking) + Send + 'static>;

/// The match currently holding the server. A thread only touches shared state
/// while its id is the current one.
#[derive(Debug)]
struct CurrentMatch {
    id: u64,
    stop: Arc<AtomicBool>,
}

type CurrentSlot = Arc<Mutex<Option<CurrentMatch>>>;

fn owns(current: &CurrentSlot, id: u64) -> bool {
    current.lock().unwrap().as_ref().is_some_and(|m| m.id == id)
}

/// Manages a single match, running the scheduler on a dedicated OS thread
/// and broadcasting frames to subscribers via a broadcast channel.
pub struct MatchServer {
    broadcast_tx: broadcast::Sender<String>,
    current: CurrentSlot,
    next_id: AtomicU64,
    /// Last frame JSON so late-joining clients can draw immediately.
    latest_frame: Arc<Mutex<Option<String>>>,
    ranking: Arc<Mutex<Option<Ranking>>>,
    options: MatchOptions,
}

/// A claimed match slot. Dropping it without calling [`MatchSlot::launch`]
/// frees the slot again.
pub struct MatchSlot<'a> {
    server: &'a MatchServer,
    id: u64,
    stop: Arc<AtomicBool>,
    launched: bool,
}

impl Default for MatchServer {
    fn default() -> Self {
        MatchServer::new(MatchOptions::default())
    }
}

impl MatchServer {
    pub fn new(options: MatchOptions) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            broadcast_tx: tx,
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            latest_frame: Arc::new(Mutex::new(None)),
            ranking: Arc::new(Mutex::new(None)),
            options,
        }
    }

    /// Subscribe to match messages. Returns a receiver that yields JSON strings.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast_tx.subscribe()
    }

    pub fn latest_frame(&self) -> Option<String> {
        self.latest_frame.lock().unwrap().clone()
    }

    /// Ranking of the last finished match.
    pub fn ranking(&self) -> Option<Ranking> {
        self.ranking.lock().unwrap().clone()
    }

    /// True while a match holds the server, including a reserved slot not yet launched.
    pub fn is_running(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    /// Ask the running match (if any) to stop. The server is free again
    /// immediately; the old thread exits at its next tick without publishing.
    pub fn stop_match(&self) {
        if let Some(m) = self.current.lock().unwrap().take() {
            m.stop.store(true, Ordering::SeqCst);
            *self.latest_frame.lock().unwrap() = None;
            metrics::ACTIVE_MATCHES.set(0);
            tracing::info!(id = m.id, "Match stop requested");
        }
    }

    pub fn spectator_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Claim the server for a match without starting it yet.
    pub fn reserve(&self) -> Result<MatchSlot<'_>, MatchError> {
        let mut current = self.current.lock().unwrap();
        if current.is_some() {
            return Err(MatchError::AlreadyRunning);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        *current = Some(CurrentMatch {
            id,
            stop: stop.clone(),
        });
        Ok(MatchSlot {
            server: self,
            id,
            stop,
            launched: false,
        })
    }

    /// Start a match. The loop runs on a dedicated OS thread because agents
    /// hold Lua VMs and are not `Send`.
    pub fn start_match(
        &self,
        entrants: Vec<Entrant>,
        display: DisplaySize,
        on_win: Option<WinHandler>,
    ) -> Result<(), MatchError> {
        self.reserve()?.launch(entrants, display, on_win);
        Ok(())
    }
}

impl Drop for MatchSlot<'_> {
    fn drop(&mut self) {
        if !self.launched {
            let mut current = self.server.current.lock().unwrap();
            if current.as_ref().is_some_and(|m| m.id == self.id) {
                *current = None;
            }
        }
    }
}

impl MatchSlot<'_> {
    /// Run the match in the claimed slot.
    pub fn launch(mut self, entrants: Vec<Entrant>, display: DisplaySize, on_win: Option<WinHandler>) {
        self.launched = true;
        let server = self.server;
        let id = self.id;
        let stop = self.stop.clone();
        let tx = server.broadcast_tx.clone();
        let current = server.current.clone();
        let latest_frame = server.latest_frame.clone();
        let ranking_slot = server.ranking.clone();
        let options = server.options.clone();

        *ranking_slot.lock().unwrap() = None;
        metrics::ACTIVE_MATCHES.set(1);
        metrics::MATCHES_STARTED_TOTAL.inc();
        let started = Instant::now();

        std::thread::spawn(move || {
            let publish = |msg: &ArenaMessage| -> Option<String> {
                if stop.load(Ordering::SeqCst) {
                    return None;
                }
                let json = serde_json::to_string(msg).ok()?;
                let _ = tx.send(json.clone());
                Some(json)
            };

            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let loader = Loader::new(options.loader.clone());
                let agents = load_entrants(&loader, &entrants, |e| {
                    let name = match &e {
                        LoaderError::CompileFailed { name, .. }
                        | LoaderError::InstantiationFailed { name, .. }
                        | LoaderError::ContractMismatch { name } => name.clone(),
                    };
                    publish(&ArenaMessage::LoadError {
                        agent: name,
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                });

                let mut arena = match Arena::new(agents, display, options.arena.clone()) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!("Cannot build arena: {e}");
                        publish(&ArenaMessage::MatchError { error: e.to_string() });
                        return false;
                    }
                };
                tracing::info!(
                    id,
                    agents = arena.live_count(),
                    rows = arena.grid.rows,
                    cols = arena.grid.cols,
                    "Match started"
                );

                let tick_len = Duration::from_millis(options.scheduler.ms_per_tick);
                let ticks_per_update = options.scheduler.ticks_per_update.max(1);
                let mut tick: u64 = 0;
                let mut cycles: u64 = 0;

                while !stop.load(Ordering::SeqCst) {
                    tick += 1;
                    let mut finished = None;
                    if tick % ticks_per_update == 0 {
                        cycles += 1;
                        finished = arena.run_cycle();
                    }

                    if let Some(json) = publish(&ArenaMessage::Frame(arena.snapshot())) {
                        if owns(&current, id) {
                            *latest_frame.lock().unwrap() = Some(json);
                        }
                    }

                    if let Some(ranking) = finished {
                        if !owns(&current, id) {
                            break;
                        }
                        tracing::info!(winner = ?ranking.winner(), cycles, "Match won");
                        publish(&ArenaMessage::Ranking {
                            standings: ranking.standings.clone(),
                            cycles,
                        });
                        *ranking_slot.lock().unwrap() = Some(ranking.clone());
                        if let Some(callback) = on_win {
                            callback(ranking);
                        }
                        return true;
                    }

                    if options.max_cycles.is_some_and(|max| cycles >= max) {
                        tracing::info!(cycles, "Cycle limit reached without a winner");
                        return true;
                    }

                    std::thread::sleep(tick_len);
                }
                tracing::info!(id, cycles, "Match stopped");
                true
            }));

            match result {
                Ok(true) => {
                    metrics::MATCHES_COMPLETED_TOTAL.inc();
                    metrics::MATCH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
                }
                Ok(false) => metrics::MATCHES_ERRORED_TOTAL.inc(),
                Err(payload) => {
                    tracing::error!("Match thread panicked: {}", panic_message(payload));
                    metrics::MATCHES_ERRORED_TOTAL.inc();
                }
            }

            // A stopped match has already handed the server to its successor.
            let mut slot = current.lock().unwrap();
            if slot.as_ref().is_some_and(|m| m.id == id) {
                *slot = None;
                metrics::ACTIVE_MATCHES.set(0);
                *latest_frame.lock().unwrap() = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WANDERER: &str = r#"
        return function()
            return {
                cycle = function(self)
                    turn(TURN_LEFT)
                    move()
                end
            }
        end
    "#;

    fn display() -> DisplaySize {
        DisplaySize {
            width: 400,
            height: 300,
        }
    }

    fn fast_options() -> MatchOptions {
        MatchOptions {
            arena: ArenaConfig {
                seed: Some(11),
                ..ArenaConfig::default()
            },
            scheduler: SchedulerConfig {
                ms_per_tick: 1,
                ticks_per_update: 1,
            },
            ..MatchOptions::default()
        }
    }

    #[test]
    fn test_match_server_new() {
        let server = MatchServer::default();
        assert!(!server.is_running());
        assert!(server.ranking().is_none());
    }

    #[test]
    fn test_arena_message_serialization() {
        let msg = ArenaMessage::Ranking {
            standings: vec!["a".into(), "b".into()],
            cycles: 12,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ranking\""));
        assert!(json.contains("\"standings\":[\"a\",\"b\"]"));

        let msg = ArenaMessage::LoadError {
            agent: "x".into(),
            kind: "compile_failed".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"load_error\""));
    }

    #[test]
    fn test_headless_single_survivor() {
        let entrants = vec![
            Entrant {
                name: "Solo".into(),
                source: WANDERER.into(),
            },
            Entrant {
                name: "Broken".into(),
                source: "this is not lua".into(),
            },
        ];
        let outcome = run_match_headless(entrants, display(), &fast_options(), 10).unwrap();
        assert_eq!(outcome.load_errors.len(), 1);
        assert_eq!(outcome.cycles, 1);
        assert_eq!(outcome.ranking.unwrap().standings, vec!["Solo".to_string()]);
    }

    #[test]
    fn test_headless_cycle_bound() {
        let entrants = vec![
            Entrant {
                name: "A".into(),
                source: WANDERER.into(),
            },
            Entrant {
                name: "B".into(),
                source: WANDERER.into(),
            },
        ];
        let outcome = run_match_headless(entrants, display(), &fast_options(), 3).unwrap();
        assert!(outcome.cycles <= 3);
    }

    #[test]
    fn test_headless_invalid_display() {
        let r = run_match_headless(
            vec![],
            DisplaySize { width: 0, height: 0 },
            &fast_options(),
            5,
        );
        assert!(matches!(r, Err(MatchError::Arena(ArenaError::InvalidDisplay { .. }))));
    }

    #[test]
    fn test_start_match_reports_ranking() {
        let server = MatchServer::new(fast_options());
        let mut rx = server.subscribe();
        let (win_tx, win_rx) = std::sync::mpsc::channel();
        server
            .start_match(
                vec![Entrant {
                    name: "Only".into(),
                    source: WANDERER.into(),
                }],
                display(),
                Some(Box::new(move |r| {
                    let _ = win_tx.send(r);
                })),
            )
            .unwrap();

        let ranking = win_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ranking.winner(), Some("Only"));

        let mut saw_ranking = false;
        while let Ok(msg) = rx.try_recv() {
            if msg.contains("\"type\":\"ranking\"") {
                saw_ranking = true;
            }
        }
        assert!(saw_ranking);

        for _ in 0..100 {
            if !server.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_running());
        assert_eq!(server.ranking().unwrap().standings, vec!["Only".to_string()]);
    }

    #[test]
    fn test_start_match_while_running() {
        let server = MatchServer::new(MatchOptions {
            scheduler: SchedulerConfig {
                ms_per_tick: 10,
                ticks_per_update: 1000,
            },
            ..fast_options()
        });
        let two = vec![
            Entrant {
                name: "A".into(),
                source: WANDERER.into(),
            },
            Entrant {
                name: "B".into(),
                source: WANDERER.into(),
            },
        ];
        server.start_match(two.clone(), display(), None).unwrap();
        assert!(matches!(
            server.start_match(two, display(), None),
            Err(MatchError::AlreadyRunning)
        ));
        server.stop_match();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!server.is_running());
    }

    fn pair(a: &str, b: &str) -> Vec<Entrant> {
        vec![
            Entrant {
                name: a.into(),
                source: WANDERER.into(),
            },
            Entrant {
                name: b.into(),
                source: WANDERER.into(),
            },
        ]
    }

    #[test]
    fn test_restart_after_stop_runs_only_new_match() {
        let server = MatchServer::new(MatchOptions {
            scheduler: SchedulerConfig {
                ms_per_tick: 200,
                ticks_per_update: 1000,
            },
            ..fast_options()
        });
        let mut rx = server.subscribe();

        server.start_match(pair("old1", "old2"), display(), None).unwrap();
        server.stop_match();
        assert!(!server.is_running());
        server.start_match(pair("new1", "new2"), display(), None).unwrap();

        std::thread::sleep(Duration::from_millis(700));

        let (mut old, mut new) = (0, 0);
        while let Ok(msg) = rx.try_recv() {
            if msg.contains("old1") {
                old += 1;
            }
            if msg.contains("new1") {
                new += 1;
            }
        }
        // At most the frame the old thread published before noticing the stop
        assert!(old <= 1, "old match kept publishing: {old} frames");
        assert!(new >= 2);
        assert!(server.is_running());
        assert!(server.latest_frame().is_some_and(|f| f.contains("new1")));

        server.stop_match();
        assert!(server.latest_frame().is_none());
    }

    #[test]
    fn test_reserved_slot_blocks_and_releases() {
        let server = MatchServer::new(fast_options());
        let slot = server.reserve().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.reserve(), Err(MatchError::AlreadyRunning)));
        assert!(matches!(
            server.start_match(pair("a", "b"), display(), None),
            Err(MatchError::AlreadyRunning)
        ));

        drop(slot);
        assert!(!server.is_running());
        assert!(server.reserve().is_ok());
    }
}
