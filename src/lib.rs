/*!
Forking service: a local daemon that forks workers on request over a Unix control socket.

Architecture
- `server`: binds the control socket, runs the single-threaded poll loop and dispatches requests.
- `protocol`: reads one newline-framed request under a deadline and parses it into a
  `ParsedRequest`; renders every response line.
- `spawner`: forks, and in the child performs the FIFO rendezvous before running the `Executor`.
- `reaper` / `shutdown`: collect exited children and drain the table on termination.
- `children`: the pid-keyed table of live workers.
- `signals`: SIGCHLD/SIGTERM self-pipe and the child-side reset.

Environment
- FORKING_SERVICE_SOCKET, _SOCKET_MODE, _ACCEPT_TIMEOUT, _REQUEST_TIMEOUT,
  _WAIT_FOR_CHILDREN_TIMEOUT, _SHUTDOWN_GRACE, _CHILD_CONNECT_TIMEOUT, _TEMP_DIR: see `config`.
- FORKING_SERVICE_LOG (falls back to RUST_LOG): tracing filter directives.

Embedding
```no_run
use forking_service::{ForkingService, ServiceConfig, EnvOverlay};

let exec = |argv: &[String], _env: &EnvOverlay| -> i32 {
    println!("running {}", argv.join(" "));
    0
};
let mut service = ForkingService::new(ServiceConfig::from_env()?, exec)?;
service.serve()?;
# Ok::<(), forking_service::ServiceError>(())
```
*/

pub mod children;
pub mod config;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod reaper;
pub mod server;
pub mod shutdown;
pub mod signals;
pub mod spawner;
pub mod util;

pub use children::{ChildRecord, ChildTable};
pub use config::ServiceConfig;
pub use errors::{
    exit_code_for_io_error, exit_code_for_service_error, ParseError, RequestError, ServiceError,
};
pub use executor::{Executor, ProcessExecutor};
pub use logging::init_logging;
pub use protocol::{EnvOverlay, ParsedRequest};
pub use server::{ForkingService, ServiceState};
pub use shutdown::{ShutdownReport, ShutdownSequencer};
pub use spawner::Spawn;
