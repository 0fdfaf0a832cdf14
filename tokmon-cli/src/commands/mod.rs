pub mod pricing;
pub mod serve;

pub use pricing::{cmd_cost, cmd_pricing, OutputFormat};
pub use serve::{cmd_serve, load_serve_config};
