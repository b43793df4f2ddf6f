//! Types shared between the lobby sync client and anything that speaks its
//! wire protocol: the session state model, the push-channel event set, and the
//! pure reducer that applies one event to a view.

pub mod protocol;
pub mod route;
pub mod session;
pub mod view;

pub use protocol::{
    decode, ClientFrame, Countdown, DecodeError, Departure, Envelope, Kick, LogLine,
    ReadinessChange, ServerError, ServerEvent, SessionStart,
};
pub use route::{route, RouteError};
pub use session::{Session, SessionScope};
pub use view::{
    AuthoritativeView, SessionConfig, SessionSnapshot, SessionStatus, Slot, SlotKind, MAX_SLOTS,
};
