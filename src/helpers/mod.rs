pub mod add_trackers_to_magnet_uri;
pub mod parse_magnet_uri;
pub mod should_ignore_path;

pub fn get_user_agent() -> &'static str {
    concat!("decypharr/", env!("CARGO_PKG_VERSION"))
}
