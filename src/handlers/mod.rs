pub mod c2b_handlers;
pub mod extract;
pub mod stkpush_handlers;
