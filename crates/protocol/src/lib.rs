pub mod bencode;
pub mod ng;

pub use bencode::{Bencode, BencodeError};
pub use ng::NgError;
