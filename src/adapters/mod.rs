//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter          | Implements    | Connects to                  |
//! |------------------|---------------|------------------------------|
//! | `config_file`    | ConfigPort    | JSON snapshot on disk        |
//! | `control_socket` | —             | Unix socket line protocol    |
//! | `gpio`           | PinDriver     | Linux sysfs / embedded-hal   |
//! | `log_sink`       | EventSink     | Process logger               |
//! | `notify`         | Notifier      | Log output / SMTP relay      |
//! | `shell`          | CommandRunner | `sh -c` with timeout         |
//! | `sim`            | PinDriver     | In-memory pin levels         |
//! | `time`           | Clock         | `std::time::Instant` / manual|

pub mod config_file;
pub mod control_socket;
pub mod gpio;
pub mod log_sink;
pub mod notify;
pub mod shell;
pub mod sim;
pub mod time;
