//! Client side of the sector tracker: the backend seam, the pure sync
//! reducer and the per-surface session that ties them together.

pub mod backend;
pub mod error;
pub mod surface;
pub mod sync;

pub use backend::{EventStream, HttpBackend, SectorBackend};
pub use error::SyncError;
pub use surface::{QuickAction, SurfaceEvent, SurfaceRole, SurfaceSession, ToastLevel};
pub use sync::{reduce, render, RenderDelta, StatusSummary, SurfaceState, SurfaceView};
