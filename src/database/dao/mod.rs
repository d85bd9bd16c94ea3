pub mod routes;
pub mod usage;

pub use routes::RouteDao;
pub use usage::{current_hour_key, today_key, UsageDao};
