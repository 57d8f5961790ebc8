pub mod metadata;
pub mod panel;
pub mod test_record;
