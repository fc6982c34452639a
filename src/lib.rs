//! # xmlsig-core
//!
//! Motor de assinatura e verificacao de XML Digital Signature (XML-DSig),
//! assinaturas RSA enveloped, seguindo a recomendacao W3C XML-Signature
//! Syntax and Processing.
//!
//! O motor cobre quatro subsistemas: o Processador de Referencias (dereferencia
//! fragmentos assinados e aplica a cadeia de Transforms), o Canonicalizador
//! (serializa para os bytes exatos que alimentam o digest), o Codec do valor
//! de assinatura (monta o bloco PKCS#1 v1.5 com o prefixo ASN.1 `DigestInfo`)
//! e o Orquestrador `sign`/`verify`, que compoe os tres e resolve chaves e
//! certificados.
//!
//! Fora de escopo (tratados como colaboradores externos, consumidos via
//! trait): Transforms de XPath/XSLT, multiplos algoritmos de digest distintos
//! dentro de um mesmo `<Signature>`, e resolucao de URIs externas (apenas
//! `#id` no mesmo documento ou URI vazia).
//!
//! ## Exemplo de uso
//!
//! ```rust,ignore
//! use xmlsig_core::{KeySpec, VerifyOptions, verify};
//! use xmlsig_core::tree::Tree;
//!
//! fn main() -> xmlsig_core::Result<()> {
//!     let doc = Tree::parse(&std::fs::read_to_string("assinado.xml")?)?;
//!     let keyspec = KeySpec::parse("aa:bb:cc:..."); // fingerprint embutido no documento
//!     let ok = verify(&doc, &keyspec, &VerifyOptions::default())?;
//!     assert!(ok);
//!     Ok(())
//! }
//! ```

pub mod canon;
pub mod cert;
pub mod codec;
pub mod error;
pub mod keyprovider;
pub mod keyspec;
pub mod orchestrator;
pub mod reference;
pub mod template;
pub mod transform;
pub mod tree;

// Re-exportacao dos tipos/operacoes principais para facilitar o uso.
pub use cert::{fingerprint_hex, resolve_cert, CertificateIndex};
pub use error::{Result, XmlSigError};
pub use keyprovider::{KeyProvider, PemKeyProvider, Pkcs12KeyProvider, ProviderSigner, Signer};
pub use keyspec::KeySpec;
pub use orchestrator::{sign, verify, SignOptions, VerifyOptions};
pub use template::TemplateOptions;
pub use tree::Tree;
