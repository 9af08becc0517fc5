pub mod html;
pub mod robots;


pub use html::parse_structured;
pub use robots::RobotsPolicy;
