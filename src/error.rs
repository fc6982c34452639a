//! Erros do motor de assinatura XML-DSig

use derive_more::{Display, Error, From};

/// Conjunto fechado de erros que o motor de assinatura/verificacao pode produzir.
#[derive(Debug, Display, Error, From)]
pub enum XmlSigError {
    #[display(fmt = "Transform desconhecido: {}", _0)]
    UnknownTransform(#[error(not(source))] String),

    #[display(fmt = "Reference com URI desconhecida: {}", _0)]
    UnknownReference(#[error(not(source))] String),

    #[display(fmt = "Reference nao resolvida: nenhum elemento com id '{}'", _0)]
    UnresolvedReference(#[error(not(source))] String),

    #[display(fmt = "Algoritmos de hash inconsistentes dentro de um Signature: {} != {}", _0, _1)]
    InconsistentHash(#[error(not(source))] String, #[error(not(source))] String),

    #[display(fmt = "Elemento obrigatorio ausente: {}", _0)]
    MissingElement(#[error(not(source))] String),

    #[display(fmt = "Chave/certificado nao encontrado para keyspec: {}", _0)]
    KeyNotFound(#[error(not(source))] String),

    #[display(fmt = "Modulo RSA pequeno demais para acomodar o DigestInfo")]
    KeyTooSmall,

    #[display(fmt = "Assinatura nao confere com o bloco esperado")]
    SignatureMismatch,

    #[display(fmt = "Canonicalizacao invalida: {}", _0)]
    CanonicalizationError(#[error(not(source))] String),

    #[display(fmt = "Erro de IO: {}", _0)]
    Io(std::io::Error),

    #[display(fmt = "Erro de XML: {}", _0)]
    Xml(quick_xml::Error),
}

pub type Result<T> = std::result::Result<T, XmlSigError>;
