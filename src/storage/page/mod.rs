mod index_page;

pub use index_page::*;
