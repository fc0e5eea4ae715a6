//! 公共组件

pub mod path_params;

pub use path_params::{PathParams, PathTemplate};
