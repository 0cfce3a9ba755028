//! ssh-agent wire protocol framing.

pub mod codec;
