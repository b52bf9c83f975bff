//! # stein
//!
//! A Linux container library built on two pieces:
//!
//! - an **overlay layer engine**: a sorted stack of layer directories is
//!   mounted as a single writable tree, and upper layers can later be merged
//!   down into lower ones so that accumulated changes become part of a
//!   permanent base;
//! - a **container lifecycle** driven by the host service manager
//!   (`systemd-nspawn` and friends): the mounted tree is either booted as a
//!   full system or entered as an ephemeral chroot, and processes are run
//!   inside it.
//!
//! ## Usage
//!
//! ```no_run
//! use stein::{Container, LayerStack};
//! use stein::launcher::ProcessIo;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> stein::SteinResult<()> {
//! let layers = LayerStack::new(vec!["99-local".into(), "00-base".into()])?;
//! let container = Container::new("devbox", "/var/lib/stein", layers);
//!
//! // Mounts the overlay, boots the tree if it carries an init, and runs
//! // the command inside.
//! let code = container
//!     .run(
//!         &["/bin/true".to_string()],
//!         ProcessIo::inherit(),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(code, 0);
//!
//! container.shutdown().await?;
//! container.filesystem().unmount()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod filesystem;
pub mod launcher;
pub mod runtime;

pub use filesystem::{Filesystem, LayerStack};
pub use runtime::Container;
pub use stein_common::{SteinError, SteinResult};
