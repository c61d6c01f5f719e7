pub mod owned;
pub mod ticket;

pub use self::owned::{OwnedMutex, OwnedMutexGuard};
pub use self::ticket::{TicketMutex, TicketMutexGuard};

/// A lock that provides mutually exclusive data access.
pub type Mutex<T> = TicketMutex<T>;
/// A guard that provides mutable data access.
pub type MutexGuard<'a, T> = TicketMutexGuard<'a, T>;
