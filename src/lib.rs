pub mod activations;
pub mod backward_data;
pub mod backward_weights;
pub mod case;
pub mod compare;
pub mod config;
pub mod engine;
pub mod errors;
pub mod forward;
pub mod layout;
pub mod profile;
pub mod snapshot;
pub mod strided;
// Re-export key structs for easier access
pub use backward_data::{BackwardDataBuffers, BackwardDataInputs, backward_data};
pub use backward_weights::backward_weights;
pub use case::{CaseOutputs, ReferenceCase};
pub use compare::{Tolerance, relative_rms_error, verify};
pub use config::{DirectionMode, GruConfig, InputMode};
pub use engine::{BackwardDataPass, ForwardPass, GruReference, Inference};
pub use errors::{GruError, Result};
pub use forward::{ForwardBuffers, forward};
pub use layout::{Direction, Gate, Layout};
pub use profile::BatchProfile;
pub use snapshot::{GoldenCase, SnapshotFormat, VersionedSnapshot, verify_snapshot};
pub use strided::{StridedView, affine};
