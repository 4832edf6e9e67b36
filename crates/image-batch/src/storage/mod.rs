//! Working-area storage for uploaded and converted files

mod working_area;

pub use working_area::{sanitize_file_name, WorkingArea, WorkingAreaManager};
