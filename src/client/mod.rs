pub use self::http::{Client, ClientBuilder, Pending};
pub use self::request::RequestBuilder;
pub use self::response::Response;

mod dispatch;
mod http;
mod request;
mod response;
