pub mod font;
pub mod generator;
pub mod layout;

pub use font::{FontSources, FontState};
pub use generator::{ChartImages, ReportConfig, ReportGenerator};
