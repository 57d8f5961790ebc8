pub mod extraction;
pub mod normalize;
pub mod pipeline;
pub mod preprocess;
pub mod queue;
pub mod recognition;
pub mod runner;
pub mod uploads;
pub mod validation;
