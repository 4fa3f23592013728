//! # tether-renderer
//!
//! Tera-based template rendering against a snapshot of watched values.
//!
//! A render never blocks and never talks to a store. Templates read values
//! through the functions in [`functions`]; each call records the
//! [`Dependency`](tether_core::Dependency) it touched, and a render that
//! touched a dependency absent from the snapshot comes back
//! [`RenderOutcome::NotReady`] with everything it discovered.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_core::Values;
//! use tether_renderer::{RenderOutcome, Template};
//!
//! let template = Template::from_contents("app.conf", r#"port={{ key(path="app/port") }}"#)?;
//! match template.render(Arc::new(Values::new()))? {
//!     RenderOutcome::Ready { contents, .. } => println!("{contents}"),
//!     RenderOutcome::NotReady { missing, .. } => println!("waiting on {missing:?}"),
//! }
//! # Ok::<(), tether_renderer::RenderError>(())
//! ```

pub mod engine;
pub mod error;
pub mod functions;

pub use engine::{RenderOutcome, Template};
pub use error::RenderError;
