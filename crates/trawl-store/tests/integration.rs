mod integration {
    pub mod common;
    mod cache_store_tests;
    mod pipeline_tests;
}
