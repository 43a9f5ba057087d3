pub mod common;

pub mod lock;

pub mod conflict;

pub mod queue;

pub mod table_locks;

pub mod trx;

pub mod waits;

pub mod manager;

pub mod structural;

pub mod implicit;

/// Error handling approach: boxing errors.
/// Pros: simple and allows original errors to be preserved.
/// Cons: the underlying error type is only known at runtime and is not statically determined.
///
/// Box converts any type that implements the Error trait into the trait object Box<Error> using From.
///
/// For code on the normal operation path boxing is avoided, e.g., lock acquisition returns
/// the concrete `NonFatalError` so callers can match on deadlock vs refusal without downcasting.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias.
pub type Result<T> = std::result::Result<T, BoxedError>;
