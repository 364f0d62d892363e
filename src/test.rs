#![cfg(any(test, feature = "mock"))]


mod mutations;
mod paging;
