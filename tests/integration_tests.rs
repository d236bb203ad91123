// Gateway file to expose integration tests from the integration/ subdirectory
// This file allows Rust's test runner to discover tests in subdirectories

mod common;

#[path = "integration/test_segment_lifecycle.rs"]
mod test_segment_lifecycle;

#[path = "integration/test_ann_search.rs"]
mod test_ann_search;

#[path = "integration/test_vector_script.rs"]
mod test_vector_script;

#[path = "integration/test_settings_layering.rs"]
mod test_settings_layering;
