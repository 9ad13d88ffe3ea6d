pub mod camera_id;
pub mod device_path;
