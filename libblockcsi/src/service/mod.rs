//! Concrete CSI services.
//!
//! | Service | Trait | Talks to |
//! |---|---|---|
//! | [`ControllerService`] | [`CsiController`](crate::controller::CsiController) | [`Cloud`](crate::cloud::Cloud) |
//! | [`NodeService`] | [`CsiNode`](crate::node::CsiNode) | [`Mounter`](crate::mounter::Mounter) |

pub mod controller;
pub mod node;

pub use controller::ControllerService;
pub use node::NodeService;

use crate::error::CsiError;

pub(crate) fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        Err(CsiError::InvalidArgument(format!("{what} is required")))
    } else {
        Ok(())
    }
}
