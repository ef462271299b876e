//! Pool of authenticated sessions for one identity
//!
//! Keeps up to `max` sessions authenticated as a single account, handing out
//! idle ones first and authenticating new ones on demand. Password rotation
//! through a pooled session does not disturb the other sessions; the pool
//! adopts the new password for sessions it authenticates afterwards.
//!
//! Session lifecycle inside the pool:
//! 1. `acquire()` takes an idle session or authenticates a new one
//! 2. The caller uses it, possibly rotating the identity's password
//! 3. Dropping or `release()`-ing the `PooledSession` returns it to idle
//! 4. `discard()` logs it off instead
//! 5. The keepalive task pings idle sessions, evicts dead ones and refills
//!    the pool up to `min`
//! 6. `close()` logs off idle sessions; busy ones are logged off on release

pub mod config;
pub mod keepalive;
pub mod pool;

pub use config::PoolConfig;
pub use keepalive::spawn_keepalive_task;
pub use pool::{PoolStats, PooledSession, RotationEvent, SessionPool};
