pub use crate::{BlockHash, BlockHeight};
pub use anyhow::{bail, format_err, Context as _, Result};
pub use log::{debug, error, info, trace, warn};
