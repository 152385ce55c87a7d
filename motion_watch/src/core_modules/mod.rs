pub mod background_model;
pub mod blob_detector;
pub mod camera_pool;
pub mod camera_source;
pub mod compositor;
pub mod event_log;
pub mod frame;
pub mod motion_classifier;
pub mod overlay;
pub mod recording_controller;
