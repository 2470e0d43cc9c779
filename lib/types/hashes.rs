use borsh::BorshSerialize;

pub type Hash = [u8; blake3::OUT_LEN];

pub fn hash(data: &[u8]) -> Hash {
    blake3::hash(data).into()
}

pub fn hash_with_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(&[0]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the canonical borsh encoding of a value
pub fn hash_borsh<T>(domain: &str, value: &T) -> Result<Hash, borsh::io::Error>
where
    T: BorshSerialize,
{
    let bytes = borsh::to_vec(value)?;
    Ok(hash_with_domain(domain, &bytes))
}
