//! Wire contracts shared by the Codot bridge: the command/response envelopes,
//! captured entry records and the game side-channel framing.

pub mod capture;
pub mod game_channel;
pub mod protocol;

pub use capture::{CapturedEntry, EntryKind, EntrySource, KindFilter, NewEntry};
pub use game_channel::{GameCommand, GameFrame, GameMessage};
pub use protocol::{CommandEnvelope, CommandError, ErrorCode, Params, ResponseEnvelope};
