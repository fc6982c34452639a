//! KeySpec: localizador tagueado de chave/certificado
//!
//! Generaliza a tipagem dinamica do `keyspec` original (uma string que podia
//! ser caminho, fingerprint ou PEM cru, distinguida em tempo de execucao) em
//! um enum fechado, mais a mesma distincao feita explicitamente por
//! `KeySpec::parse` para as tres formas baseadas em string.

use std::path::Path;
use std::sync::Arc;

use crate::keyprovider::Signer;

#[derive(Clone)]
pub enum KeySpec {
    /// Caminho no sistema de arquivos para uma chave ou certificado PEM.
    Path(String),
    /// Fingerprint SHA-1 (`aa:bb:...`) de um certificado embutido no documento.
    Fingerprint(String),
    /// Conteudo PEM cru (chave ou certificado).
    Pem(String),
    /// Handle opaco de chave privada externa (ex.: PKCS#11), com certificado proprio.
    Signer(Arc<dyn Signer>),
    /// Blob PKCS#12/PFX em memoria mais senha, no formato que `CertificadoA1::from_bytes` carrega.
    Pkcs12 { der: Vec<u8>, password: String },
}

impl KeySpec {
    /// Classifica uma string nas tres formas baseadas em texto: caminho de
    /// arquivo existente, fingerprint (contem `:`, sem cabecalho PEM) ou PEM cru.
    pub fn parse(s: &str) -> KeySpec {
        if Path::new(s).is_file() {
            return KeySpec::Path(s.to_string());
        }
        if looks_like_fingerprint(s) {
            return KeySpec::Fingerprint(s.to_string());
        }
        KeySpec::Pem(s.to_string())
    }
}

fn looks_like_fingerprint(s: &str) -> bool {
    let s = s.trim();
    !s.contains("-----") && s.contains(':') && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':')
}
