//! Decoding to 16-bit PCM
//!
//! Container/codec decoding is delegated to symphonia; everything leaving
//! this module is interleaved signed 16-bit PCM.

pub mod decoder;
pub mod pcm;

pub use decoder::{DecoderStats, PcmDecoder};
