//! Codec do valor de assinatura (PKCS#1 v1.5)
//!
//! Monta o bloco `EMSA-PKCS1-v1_5` (DigestInfo ASN.1 BER + padding `0x00 0x01
//! 0xFF.. 0x00`) que e elevado a potencia privada pela chave RSA. O crate
//! `rsa` faz esse padding internamente em `sign`/`verify`, mas o motor
//! original monta o bloco a mao para poder reusa-lo tanto na assinatura
//! quanto, em verificacao manual, na comparacao byte a byte -- preservado
//! aqui pelos mesmos motivos de fidelidade ao `original_source`.

use crate::error::{Result, XmlSigError};
use crate::reference::{DIGEST_SHA1, DIGEST_SHA256, DIGEST_SHA384, DIGEST_SHA512};

/// Prefixo ASN.1 BER do `DigestInfo` (sem o digest em si) para cada algoritmo
/// de hash suportado, na mesma tabela do `ASN1_BER_ALG_DESIGNATOR_PREFIX`
/// original.
fn digest_info_prefix(digest_algorithm: &str) -> Result<&'static [u8]> {
    match digest_algorithm {
        DIGEST_SHA1 => Ok(&[
            0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
        ]),
        DIGEST_SHA256 => Ok(&[
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
            0x04, 0x20,
        ]),
        DIGEST_SHA384 => Ok(&[
            0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00,
            0x04, 0x30,
        ]),
        DIGEST_SHA512 => Ok(&[
            0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00,
            0x04, 0x40,
        ]),
        other => Err(XmlSigError::UnknownTransform(other.to_string())),
    }
}

/// Monta o `DigestInfo` completo (prefixo ASN.1 + digest bruto).
pub fn build_digest_info(digest_algorithm: &str, digest: &[u8]) -> Result<Vec<u8>> {
    let prefix = digest_info_prefix(digest_algorithm)?;
    let mut out = Vec::with_capacity(prefix.len() + digest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(digest);
    Ok(out)
}

/// Monta o bloco completo EMSA-PKCS1-v1_5 (`0x00 0x01 FF.. 0x00 DigestInfo`)
/// para um modulo RSA de `key_size_bytes` bytes, ou, se `do_pad` for `false`,
/// apenas o `DigestInfo` (`T = prefix || digest`) sem acolchoamento -- usado
/// quando quem assina de fato (um `Signer` externo, tipo PKCS#11) faz o
/// padding por conta propria e so precisa do valor prefixado. A folga de
/// padding precisa de ao menos 11 bytes (`0x00 0x01`, um byte `0x00`
/// separador e pelo menos 8 bytes `0xFF`); modulos menores que isso falham
/// com `KeyTooSmall`.
pub fn build_signed_block(digest_algorithm: &str, digest: &[u8], key_size_bytes: usize, do_pad: bool) -> Result<Vec<u8>> {
    let digest_info = build_digest_info(digest_algorithm, digest)?;
    if !do_pad {
        return Ok(digest_info);
    }
    let padding_len = key_size_bytes
        .checked_sub(digest_info.len() + 3)
        .ok_or(XmlSigError::KeyTooSmall)?;
    if padding_len < 8 {
        return Err(XmlSigError::KeyTooSmall);
    }

    let mut block = Vec::with_capacity(key_size_bytes);
    block.push(0x00);
    block.push(0x01);
    block.extend(std::iter::repeat(0xFF).take(padding_len));
    block.push(0x00);
    block.extend_from_slice(&digest_info);
    debug_assert_eq!(block.len(), key_size_bytes);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_block_has_expected_length_and_framing() {
        let digest = [0u8; 32];
        let block = build_signed_block(DIGEST_SHA256, &digest, 256, true).unwrap();
        assert_eq!(block.len(), 256);
        assert_eq!(block[0], 0x00);
        assert_eq!(block[1], 0x01);
        assert_eq!(block[2], 0xFF);
        let di_start = 256 - (19 + 32);
        assert_eq!(block[di_start - 1], 0x00);
    }

    #[test]
    fn key_too_small_for_digest_is_rejected() {
        let digest = [0u8; 64];
        let err = build_signed_block(DIGEST_SHA512, &digest, 32, true).unwrap_err();
        assert!(matches!(err, XmlSigError::KeyTooSmall));
    }

    #[test]
    fn do_pad_false_returns_bare_digest_info() {
        let digest = [0u8; 32];
        // key_size_bytes e ignorado quando do_pad=false.
        let block = build_signed_block(DIGEST_SHA256, &digest, 9999, false).unwrap();
        assert_eq!(block, build_digest_info(DIGEST_SHA256, &digest).unwrap());
    }

    #[test]
    fn unknown_digest_algorithm_errors() {
        let err = build_digest_info("urn:unknown", &[]).unwrap_err();
        assert!(matches!(err, XmlSigError::UnknownTransform(_)));
    }
}
