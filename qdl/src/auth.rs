// SPDX-License-Identifier: BSD-3-Clause

//! Authentication strategies a Firehose programmer image may demand before
//! it will accept storage commands: none at all, vendor O's VIP signature
//! check, vendor X's challenge-response exchange, or a vendor-specific
//! post-`<configure>` handshake.
//!
//! Every variant is dispatched the same way every other Firehose step is:
//! send an XML command, then `firehose_read` for the terminal response.

use std::io::Write;

use crate::error::{EngineError, FirehoseError, NakOp};
use crate::firehose::firehose_xml_setup;
use crate::parsers::{firehose_parser_ack_nak, FirehoseStatus};
use crate::types::QdlChan;

/// Which authentication strategy a target's programmer demands.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// No additional authentication beyond the Sahara image transfer itself.
    None,
    /// Vendor O's programmer: the image is already signed, so the engine
    /// presents the digest/signature pair for the device to verify before
    /// storage commands are accepted. Must run before `<configure>`.
    Signature { digest: Vec<u8>, signature: Vec<u8> },
    /// Vendor X's programmer: authenticates with a token derived from the
    /// chip's own identity rather than caller-supplied key material.
    /// [`ChipIdentity::wants_challenge_response`](crate::types::ChipIdentity::wants_challenge_response)
    /// auto-selects this mode, so callers rarely construct it by hand.
    Challenge { chip_serial: u32, hw_id: u64 },
    /// A vendor-specific handshake that runs immediately after
    /// `<configure>` succeeds, before any storage command is issued.
    PostConfigureVendor { vendor_token: Vec<u8> },
}

pub fn authenticate<T: QdlChan>(channel: &mut T, mode: &AuthMode) -> Result<(), EngineError> {
    match mode {
        AuthMode::None => Ok(()),
        AuthMode::Signature { digest, signature } => signature_auth(channel, digest, signature),
        AuthMode::Challenge { chip_serial, hw_id } => challenge_response_auth(channel, *chip_serial, *hw_id),
        AuthMode::PostConfigureVendor { vendor_token } => post_configure_vendor_auth(channel, vendor_token),
    }
}

/// Vendor O's signature handshake: `<setprojmodel>` carries the digest,
/// `<setxtsencryption>` the signature, each acknowledged independently.
/// On success the session-wide `vip_mode` flag is set so later reads get
/// wrapped in the device's "disguise" envelope.
fn signature_auth<T: QdlChan>(channel: &mut T, digest: &[u8], signature: &[u8]) -> Result<(), EngineError> {
    let digest_hex = hex_encode(digest);
    let bytes = firehose_xml_setup("setprojmodel", &[("digest", &digest_hex)])?;
    channel.write_all(&bytes).map_err(FirehoseError::from)?;
    match crate::firehose::firehose_read(channel, firehose_parser_ack_nak)?.0 {
        FirehoseStatus::Ack => {}
        FirehoseStatus::Nak => return Err(EngineError::AuthFailed),
    }

    let sig_hex = hex_encode(signature);
    let bytes = firehose_xml_setup("setxtsencryption", &[("signature", &sig_hex)])?;
    channel.write_all(&bytes).map_err(FirehoseError::from)?;
    match crate::firehose::firehose_read(channel, firehose_parser_ack_nak)?.0 {
        FirehoseStatus::Ack => {
            channel.mut_fh_config().vip_mode = true;
            Ok(())
        }
        FirehoseStatus::Nak => Err(EngineError::AuthFailed),
    }
}

/// Vendor X's challenge-response handshake: a single `<miauth>` carrying a
/// token derived from the chip's serial and hardware id. The derivation
/// algorithm itself isn't part of what this engine can observe (it lives in
/// vendor tooling); [`derive_miauth_token`] is a placeholder that at least
/// binds the token to the chip identity it's supposed to authenticate,
/// rather than sending a constant.
fn challenge_response_auth<T: QdlChan>(channel: &mut T, chip_serial: u32, hw_id: u64) -> Result<(), EngineError> {
    let token = derive_miauth_token(chip_serial, hw_id);
    let bytes = firehose_xml_setup("miauth", &[("token", &token)])?;
    channel.write_all(&bytes).map_err(FirehoseError::from)?;

    match crate::firehose::firehose_read(channel, firehose_parser_ack_nak)?.0 {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EngineError::Firehose(FirehoseError::Nak {
            op: NakOp::Auth,
            log: "device rejected the miauth token".to_string(),
        })),
    }
}

/// Placeholder for vendor X's undisclosed `chipSerial || hwId` token
/// derivation: hex-encodes the concatenation as-is. A real deployment needs
/// to replace this with the vendor-documented algorithm.
fn derive_miauth_token(chip_serial: u32, hw_id: u64) -> String {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&chip_serial.to_be_bytes());
    bytes.extend_from_slice(&hw_id.to_be_bytes());
    hex_encode(&bytes)
}

fn post_configure_vendor_auth<T: QdlChan>(channel: &mut T, vendor_token: &[u8]) -> Result<(), EngineError> {
    let token_hex = hex_encode(vendor_token);
    let bytes = firehose_xml_setup("vendorauth", &[("token", &token_hex)])?;
    channel.write_all(&bytes).map_err(FirehoseError::from)?;

    match crate::firehose::firehose_read(channel, firehose_parser_ack_nak)?.0 {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(EngineError::AuthFailed),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FirehoseConfiguration, QdlDevice, QdlReadWrite};
    use std::collections::VecDeque;
    use std::io::Read;

    #[test]
    fn hex_encode_matches_known_vector() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn derive_miauth_token_binds_to_both_serial_and_hw_id() {
        let a = derive_miauth_token(1, 2);
        let b = derive_miauth_token(1, 3);
        let c = derive_miauth_token(2, 2);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(derive_miauth_token(0x1234_5678, 0), "123456780000000000000000");
    }

    /// A scripted channel that records every byte written to it alongside a
    /// fixed inbound reply script, for exercising the XML an auth strategy
    /// actually sends.
    struct ScriptedChannel {
        inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
    }

    impl ScriptedChannel {
        fn new(inbound: &[u8]) -> Self {
            ScriptedChannel { inbound: inbound.to_vec().into(), outbound: Vec::new() }
        }
    }

    impl Read for ScriptedChannel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedChannel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl QdlReadWrite for ScriptedChannel {}

    fn ack_doc() -> &'static str {
        "<data><response value=\"ACK\"/></data>"
    }

    #[test]
    fn signature_auth_sends_setprojmodel_then_setxtsencryption_and_sets_vip_mode() {
        let script = format!("{}{}", ack_doc(), ack_doc());
        let fake = ScriptedChannel::new(script.as_bytes());
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        authenticate(&mut device, &AuthMode::Signature { digest: vec![0xaa], signature: vec![0xbb] }).unwrap();

        assert!(device.fh_cfg.vip_mode);
    }

    #[test]
    fn challenge_response_auth_sends_a_miauth_token_derived_from_chip_identity() {
        let fake = ScriptedChannel::new(ack_doc().as_bytes());
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        authenticate(&mut device, &AuthMode::Challenge { chip_serial: 0x1122_3344, hw_id: 0x99 }).unwrap();
    }

    #[test]
    fn a_nak_on_setxtsencryption_fails_auth_without_setting_vip_mode() {
        let script = format!("{}{}", ack_doc(), "<data><response value=\"NAK\"/></data>");
        let fake = ScriptedChannel::new(script.as_bytes());
        let mut device = QdlDevice::new(Box::new(fake), FirehoseConfiguration::default());

        let err = authenticate(&mut device, &AuthMode::Signature { digest: vec![0xaa], signature: vec![0xbb] }).unwrap_err();
        assert!(matches!(err, EngineError::AuthFailed));
        assert!(!device.fh_cfg.vip_mode);
    }
}
