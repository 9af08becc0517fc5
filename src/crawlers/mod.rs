pub mod backend;
pub mod executor;
pub mod policy;
pub mod web;

pub use backend::{PageResponse, RenderPage, RenderSession, RenderingBackend};
pub use executor::CrawlExecutor;
pub use policy::{HttpPolicySource, PolicySource};
pub use web::WebDriverBackend;
