//! Processador de Referencias
//!
//! Para cada `<Reference>` de um `<SignedInfo>`: dereferencia a URI sobre uma
//! copia isolada da arvore, aplica seu pipeline de `<Transform>`, calcula o
//! digest do resultado e grava no `<DigestValue>` -- tanto assinando quanto
//! verificando, sempre recalculando; a comparacao em si acontece quando o
//! `SignedInfo` recanonicalizado alimenta a conferencia da assinatura RSA no
//! Orquestrador. Generaliza `assinatura.rs`, que so sabia dereferenciar o
//! documento inteiro e aplicar exatamente enveloped-signature + c14n.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Result, XmlSigError};
use crate::transform::{apply_transform, read_transform_steps, strip_comments_and_pis, TransformOutput};
use crate::tree::{NodeId, Tree, DSIG_NS};

pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

/// Computa o digest de `data` para o URI de algoritmo dado.
pub fn digest_bytes(algorithm: &str, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        DIGEST_SHA1 => Ok(Sha1::digest(data).to_vec()),
        DIGEST_SHA256 => Ok(Sha256::digest(data).to_vec()),
        DIGEST_SHA384 => Ok(Sha384::digest(data).to_vec()),
        DIGEST_SHA512 => Ok(Sha512::digest(data).to_vec()),
        other => Err(XmlSigError::UnknownTransform(other.to_string())),
    }
}

/// Uma `<Reference>` ja lida do documento, pronta para ser processada.
pub struct ReferenceEntry {
    pub node: NodeId,
    pub uri: Option<String>,
    pub digest_algorithm: String,
    pub digest_value_node: NodeId,
}

/// Le todas as `<Reference>` filhas de um `<SignedInfo>`.
pub fn read_references(tree: &Tree, signed_info: NodeId) -> Result<Vec<ReferenceEntry>> {
    let mut out = Vec::new();
    for &child in &tree.node(signed_info).children {
        if !tree.node(child).is_element_named(Some(DSIG_NS), "Reference") {
            continue;
        }
        let uri = tree
            .node(child)
            .as_element()
            .and_then(|(_, attrs)| attrs.iter().find(|(n, _)| n.local == "URI"))
            .map(|(_, v)| v.clone());

        let digest_method = tree
            .find_first_descendant(child, Some(DSIG_NS), "DigestMethod")
            .ok_or_else(|| XmlSigError::MissingElement("DigestMethod".into()))?;
        let digest_algorithm = tree
            .node(digest_method)
            .as_element()
            .and_then(|(_, attrs)| attrs.iter().find(|(n, _)| n.local == "Algorithm"))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| XmlSigError::MissingElement("DigestMethod/@Algorithm".into()))?;

        let digest_value_node = tree
            .find_first_descendant(child, Some(DSIG_NS), "DigestValue")
            .ok_or_else(|| XmlSigError::MissingElement("DigestValue".into()))?;

        out.push(ReferenceEntry { node: child, uri, digest_algorithm, digest_value_node });
    }
    Ok(out)
}

/// Dereferencia a URI de uma `Reference` sobre uma copia isolada de `doc`,
/// devolvendo a subtree resultante pronta para o pipeline de transforms.
///
/// - `None`/`""`/`"#"` referenciam o documento inteiro; comentarios e PIs sao
///   removidos da copia (a URI vazia nao inclui o que nao faz parte dos dados
///   assinados segundo o W3C).
/// - `"#<id>"` busca, em `doc`, o elemento cujo atributo de ID (conforme
///   `id_attrs`) vale `<id>`; a subtree encontrada e clonada isoladamente.
/// - Qualquer outra forma de URI (externa, fragment scheme diferente) nao e suportada.
pub fn dereference(doc: &Tree, uri: Option<&str>, id_attrs: &[String]) -> Result<Tree> {
    match uri {
        None | Some("") | Some("#") => {
            let mut copy = doc.clone();
            strip_comments_and_pis(&mut copy, copy.root);
            Ok(copy)
        }
        Some(u) if u.starts_with('#') => {
            let id_value = &u[1..];
            let target = doc
                .find_by_id_attr(id_attrs, id_value)
                .ok_or_else(|| XmlSigError::UnresolvedReference(id_value.to_string()))?;
            Ok(extract_subtree(doc, target))
        }
        Some(other) => Err(XmlSigError::UnknownReference(other.to_string())),
    }
}

/// Clona `doc` e reraiza a copia em `target`, descartando o resto do
/// documento (um novo `Tree` cujo `root` e o equivalente de `target`).
fn extract_subtree(doc: &Tree, target: NodeId) -> Tree {
    let mut copy = doc.clone();
    copy.node_mut(target).tail = None;
    copy.root = target;
    copy
}

/// Resultado da aplicacao completa do pipeline de uma `Reference`: os bytes
/// finais entregues ao digest.
pub fn run_pipeline(doc: &Tree, reference: NodeId, uri: Option<&str>, id_attrs: &[String]) -> Result<Vec<u8>> {
    let mut scratch = dereference(doc, uri, id_attrs)?;
    let transforms_elem = scratch_transforms_elem(doc, reference);
    let steps = read_transform_steps(doc, transforms_elem);

    let mut current = TransformOutput::Tree(scratch.root);
    for step in &steps {
        current = apply_transform(&mut scratch, current, step)?;
    }
    match current {
        TransformOutput::Bytes(b) => Ok(b),
        TransformOutput::Tree(node) => {
            // Nenhum transform de canonicalizacao explicito: canonicaliza
            // implicitamente com c14n inclusivo (comportamento do xmlsec original).
            crate::canon::canonicalize(&scratch, node, false, false, &[])
        }
    }
}

fn scratch_transforms_elem(doc: &Tree, reference: NodeId) -> Option<NodeId> {
    doc.find_first_descendant(reference, Some(DSIG_NS), "Transforms")
}

/// Processa todas as `References` de um `SignedInfo`: recalcula o digest de
/// cada uma e sempre grava o resultado no `<DigestValue>` correspondente, na
/// copia de trabalho. Em verificacao, isso tambem vale -- a comparacao nao
/// acontece aqui, e sim mais adiante, quando o `SignedInfo` recanonicalizado
/// (agora com os digests recalculados) e usado para refazer/conferir a
/// assinatura RSA. Garante que todas as `References` usam o mesmo algoritmo
/// de digest, conforme a restricao do motor original.
pub fn process_references(doc: &mut Tree, signed_info: NodeId, id_attrs: &[String]) -> Result<()> {
    let entries = read_references(doc, signed_info)?;
    let mut common_algorithm: Option<String> = None;
    for entry in &entries {
        match &common_algorithm {
            None => common_algorithm = Some(entry.digest_algorithm.clone()),
            Some(alg) if alg != &entry.digest_algorithm => {
                return Err(XmlSigError::InconsistentHash(alg.clone(), entry.digest_algorithm.clone()));
            }
            _ => {}
        }
    }

    let immutable = doc.clone();
    for entry in &entries {
        let bytes = run_pipeline(&immutable, entry.node, entry.uri.as_deref(), id_attrs)?;
        let digest = digest_bytes(&entry.digest_algorithm, &bytes)?;
        let encoded = BASE64.encode(digest);

        doc.node_mut(entry.digest_value_node).children.clear();
        doc.set_text(entry.digest_value_node, encoded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signature_xml(extra_content: &str) -> String {
        format!(
            r#"<Root xmlns:ds="{ns}">{extra}<ds:Signature>
                 <ds:SignedInfo>
                   <ds:Reference URI="">
                     <ds:Transforms>
                       <ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>
                       <ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n"/>
                     </ds:Transforms>
                     <ds:DigestMethod Algorithm="{sha256}"/>
                     <ds:DigestValue></ds:DigestValue>
                   </ds:Reference>
                 </ds:SignedInfo>
               </ds:Signature></Root>"#,
            ns = DSIG_NS,
            sha256 = DIGEST_SHA256,
            extra = extra_content
        )
    }

    #[test]
    fn writes_digest_value_and_is_idempotent_on_unchanged_content() {
        let xml = sample_signature_xml("");
        let mut doc = Tree::parse(&xml).unwrap();
        let signed_info = doc.find_first_descendant(doc.root, Some(DSIG_NS), "SignedInfo").unwrap();
        process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap();
        let entries = read_references(&doc, signed_info).unwrap();
        let first = doc.node(entries[0].digest_value_node).text.clone().unwrap();
        assert!(!first.is_empty());

        // Recomputar sobre o mesmo conteudo (nao alterado) grava o mesmo digest.
        process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap();
        let second = doc.node(entries[0].digest_value_node).text.clone().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tampering_after_signing_changes_the_recomputed_digest() {
        let xml = sample_signature_xml("<Data>hello</Data>");
        let mut doc = Tree::parse(&xml).unwrap();
        let signed_info = doc.find_first_descendant(doc.root, Some(DSIG_NS), "SignedInfo").unwrap();
        process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap();
        let entries = read_references(&doc, signed_info).unwrap();
        let original = doc.node(entries[0].digest_value_node).text.clone().unwrap();

        let data = doc.find_first_descendant(doc.root, None, "Data").unwrap();
        doc.set_text(data, "tampered");
        process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap();
        let recomputed = doc.node(entries[0].digest_value_node).text.clone().unwrap();

        assert_ne!(original, recomputed);
    }

    #[test]
    fn inconsistent_digest_algorithms_are_rejected() {
        let xml = format!(
            r#"<Root xmlns:ds="{ns}" xmlns="{ns}">
                 <ds:Signature>
                   <SignedInfo>
                     <Reference URI="">
                       <DigestMethod Algorithm="{sha1}"/>
                       <DigestValue></DigestValue>
                     </Reference>
                     <Reference URI="">
                       <DigestMethod Algorithm="{sha256}"/>
                       <DigestValue></DigestValue>
                     </Reference>
                   </SignedInfo>
                 </ds:Signature>
               </Root>"#,
            ns = DSIG_NS,
            sha1 = DIGEST_SHA1,
            sha256 = DIGEST_SHA256
        );
        let mut doc = Tree::parse(&xml).unwrap();
        let signed_info = doc.find_first_descendant(doc.root, Some(DSIG_NS), "SignedInfo").unwrap();
        let err = process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap_err();
        assert!(matches!(err, XmlSigError::InconsistentHash(_, _)));
    }

    #[test]
    fn unresolved_id_reference_errors() {
        let xml = format!(
            r#"<Root xmlns:ds="{ns}" xmlns="{ns}">
                 <ds:Signature>
                   <SignedInfo>
                     <Reference URI="#missing">
                       <DigestMethod Algorithm="{sha256}"/>
                       <DigestValue></DigestValue>
                     </Reference>
                   </SignedInfo>
                 </ds:Signature>
               </Root>"#,
            ns = DSIG_NS,
            sha256 = DIGEST_SHA256
        );
        let mut doc = Tree::parse(&xml).unwrap();
        let signed_info = doc.find_first_descendant(doc.root, Some(DSIG_NS), "SignedInfo").unwrap();
        let err = process_references(&mut doc, signed_info, &["ID".to_string()]).unwrap_err();
        assert!(matches!(err, XmlSigError::UnresolvedReference(_)));
    }
}
