pub mod frame;
pub mod schema;

pub use frame::{read_frame, read_frame_timeout, write_frame, FrameRead};
pub use schema::{
    decode_request, decode_response, encode_request, encode_response, PricePair, ProductEntry,
    Request, Response,
};
