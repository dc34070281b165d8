// Kernel - core infrastructure wiring
//
// The ServerKernel holds process-wide infrastructure: the per-database pool
// set, the clock, the startup latch, and worker identity. Business policy
// belongs in the workers, not here.

pub mod health_checks;
pub mod pools;
pub mod service_host;
pub mod server_kernel;

pub use health_checks::{PgHealthCheck, ProcessCheck};
pub use pools::{PgPoolFactory, PoolSet};
pub use server_kernel::ServerKernel;
pub use service_host::{Service, ServiceHost};
