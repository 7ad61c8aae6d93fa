//! Identifier helpers shared across the negotiation engine.

use bech32::Bech32m;
use uuid7::uuid7;

// Mint a fresh uuid7 and encode it with bech32 under the given prefix.
// Listing/conversation/user ids all come through here so key prefixes in
// the store stay structural ("listing_", "conv_", "user_").
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}
