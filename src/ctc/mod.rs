pub mod forward_backward;
pub mod length;
pub mod reducer;
pub mod tensor;
