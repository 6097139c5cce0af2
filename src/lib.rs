#![forbid(unsafe_code)]

pub mod apply;
pub mod cache;
pub mod cli;
pub mod config;
pub mod create;
pub mod errors;
pub mod eval;
pub mod fat;
pub mod functions;
pub mod gpt;
pub mod logger;
pub mod manifest;
pub mod mbr;
pub mod pad_writer;
pub mod requirements;
pub mod resource;
pub mod sparse_file;
pub mod types;
pub mod uboot_env;

mod crypto;
pub use crypto::{
    blake2b_256, blake2b_256_hex, derive_meta_uuid, generate_signing_keypair,
    load_encrypted_private_key, save_encrypted_private_key, sign, verify_any, verify_blake2b_256,
};

pub use errors::{FwupError, Result};
