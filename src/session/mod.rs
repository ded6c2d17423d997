//! Test sessions: server API, per-session check ordering and abort

pub mod abort;
pub mod runner;
pub mod sequencer;
pub mod server;

pub use abort::AbortSignal;
pub use runner::{CheckError, CheckFailure, CheckSettings, CheckStage, RunningTest, VisualGridRunner};
pub use sequencer::{CheckSequencer, SequenceTicket};
pub use server::{
    BatchInfo, RunningSession, ServerConnector, SessionApi, SessionError, SessionMatcher, SessionStartInfo,
    TestResults,
};
