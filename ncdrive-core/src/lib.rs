mod account;
mod bulk;
mod poll;

pub use account::{Account, Capabilities, DavError};
pub use bulk::{BULK_ENDPOINT, BodyStream, BulkReply, FileReply, OneUploadFileData, parse_etag};
pub use poll::{PollReply, PollStatus};
