use md5::{Digest, Md5};
use picky_krb::crypto::CipherSuite;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha1::Sha1;

use crate::channel_bindings::ChannelBindings;
use crate::Secret;

pub const HASH_SIZE: usize = 16;

const SHA1_SIZE: usize = 20;

pub fn compute_md5(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut context = Md5::new();
    let mut result = [0x00; HASH_SIZE];
    context.update(data);
    result.clone_from_slice(&context.finalize());

    result
}

pub fn compute_sha1(data: &[u8]) -> [u8; SHA1_SIZE] {
    let mut context = Sha1::new();
    let mut result = [0x00; SHA1_SIZE];
    context.update(data);
    result.clone_from_slice(&context.finalize());

    result
}

/// Channel binding hash carried in the authenticator checksum.
///
/// [RFC 4121, section 4.1.1.2](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1.2): every type and
/// length is a little-endian 32-bit word.
pub fn compute_md5_channel_bindings_hash(channel_bindings: &ChannelBindings) -> [u8; HASH_SIZE] {
    let mut context = Md5::new();

    context.update(channel_bindings.initiator_addr_type.to_le_bytes());
    context.update((channel_bindings.initiator.len() as u32).to_le_bytes());
    context.update(&channel_bindings.initiator);

    context.update(channel_bindings.acceptor_addr_type.to_le_bytes());
    context.update((channel_bindings.acceptor.len() as u32).to_le_bytes());
    context.update(&channel_bindings.acceptor);

    context.update((channel_bindings.application_data.len() as u32).to_le_bytes());
    context.update(&channel_bindings.application_data);

    let mut result = [0x00; HASH_SIZE];
    result.clone_from_slice(&context.finalize());

    result
}

pub fn generate_random_symmetric_key(cipher_suite: &CipherSuite) -> Secret<Vec<u8>> {
    let key_size = cipher_suite.cipher().key_size();
    let mut key = vec![0; key_size];
    OsRng.fill_bytes(&mut key);

    Secret::new(key)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    OsRng.fill_bytes(&mut bytes);

    bytes
}

/// Initial sequence number. Kept below 2^30 like most Kerberos implementations.
pub fn random_seq_number() -> u32 {
    OsRng.gen::<u32>() & 0x3fff_ffff
}
