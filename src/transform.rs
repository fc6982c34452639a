//! Pipeline de Transforms do XML-DSig
//!
//! Aplica, em ordem, a cadeia de `<Transform>` de uma `<Reference>` sobre o
//! objeto dereferenciado. Generaliza o que `assinatura.rs` fazia de forma
//! fixa (sempre enveloped-signature seguido de c14n hardcoded) para a lista
//! configuravel de algoritmos do W3C XML-Signature.

use crate::canon::canonicalize;
use crate::error::{Result, XmlSigError};
use crate::tree::{NodeId, NodeKind, Tree, DSIG_NS, EXC_C14N_NS};

pub const TRANSFORM_ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const TRANSFORM_C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n";
pub const TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const TRANSFORM_C14N_INCLUSIVE: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";

/// Saida intermediaria de um estagio do pipeline: ou ainda uma arvore (antes
/// do ultimo Transform de canonicalizacao), ou os bytes finais ja digeriveis.
pub enum TransformOutput {
    Tree(NodeId),
    Bytes(Vec<u8>),
}

impl TransformOutput {
    fn into_tree(self) -> NodeId {
        match self {
            TransformOutput::Tree(id) => id,
            TransformOutput::Bytes(_) => {
                panic!("pipeline malformado: transform de arvore recebeu bytes de um estagio anterior")
            }
        }
    }
}

/// Uma entrada `<Transform>`: o URI do algoritmo e, opcionalmente, a lista de
/// prefixos de `InclusiveNamespaces` declarada dentro dele (exclusive c14n).
pub struct TransformStep {
    pub algorithm: String,
    pub inclusive_prefix_list: Vec<String>,
}

/// Le os filhos `<Transform>` de um elemento `<Transforms>` (se houver).
pub fn read_transform_steps(tree: &Tree, transforms_elem: Option<NodeId>) -> Vec<TransformStep> {
    let Some(transforms_elem) = transforms_elem else {
        return Vec::new();
    };
    let mut steps = Vec::new();
    for &child in &tree.node(transforms_elem).children {
        if !tree.node(child).is_element_named(Some(DSIG_NS), "Transform") {
            continue;
        }
        let algorithm = attr_algorithm(tree, child).unwrap_or_default();
        let inclusive_prefix_list = read_inclusive_namespaces(tree, child);
        steps.push(TransformStep { algorithm, inclusive_prefix_list });
    }
    steps
}

fn attr_algorithm(tree: &Tree, elem: NodeId) -> Option<String> {
    let (_, attrs) = tree.node(elem).as_element()?;
    attrs.iter().find(|(n, _)| n.local == "Algorithm").map(|(_, v)| v.clone())
}

fn read_inclusive_namespaces(tree: &Tree, transform_elem: NodeId) -> Vec<String> {
    let Some(incl) = tree.find_first_descendant(transform_elem, Some(EXC_C14N_NS), "InclusiveNamespaces") else {
        return Vec::new();
    };
    let (_, attrs) = tree.node(incl).as_element().expect("found via is_element_named");
    attrs
        .iter()
        .find(|(n, _)| n.local == "PrefixList")
        .map(|(_, v)| v.split_ascii_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Aplica uma unica etapa do pipeline ao valor corrente.
pub fn apply_transform(tree: &mut Tree, input: TransformOutput, step: &TransformStep) -> Result<TransformOutput> {
    match step.algorithm.as_str() {
        TRANSFORM_ENVELOPED_SIGNATURE => {
            let node = input.into_tree();
            remove_first_signature(tree, node)?;
            Ok(TransformOutput::Tree(node))
        }
        TRANSFORM_C14N_EXCLUSIVE => {
            let node = input.into_tree();
            let bytes = canonicalize(tree, node, true, false, &step.inclusive_prefix_list)?;
            Ok(TransformOutput::Bytes(bytes))
        }
        TRANSFORM_C14N_EXCLUSIVE_WITH_COMMENTS => {
            let node = input.into_tree();
            let bytes = canonicalize(tree, node, true, true, &step.inclusive_prefix_list)?;
            Ok(TransformOutput::Bytes(bytes))
        }
        TRANSFORM_C14N_INCLUSIVE => {
            let node = input.into_tree();
            let bytes = canonicalize(tree, node, false, false, &[])?;
            Ok(TransformOutput::Bytes(bytes))
        }
        other => Err(XmlSigError::UnknownTransform(other.to_string())),
    }
}

/// Remove o primeiro `{xmldsig}Signature` descendente de `node` (em ordem de
/// documento). A raiz nunca pode ser removida.
fn remove_first_signature(tree: &mut Tree, node: NodeId) -> Result<()> {
    let Some(sig) = tree.find_first_descendant(node, Some(DSIG_NS), "Signature") else {
        return Ok(());
    };
    if sig == tree.root {
        return Err(XmlSigError::CanonicalizationError("nao e possivel remover a assinatura raiz".into()));
    }
    tree.delete_element(sig)
}

/// Remove comentarios e instrucoes de processamento de toda a subtree de
/// `node` (usado ao dereferenciar uma URI vazia/`#`/ausente, por §4.3.1).
pub fn strip_comments_and_pis(tree: &mut Tree, node: NodeId) {
    let mut to_remove = Vec::new();
    collect_comments_and_pis(tree, node, &mut to_remove);
    for id in to_remove {
        let _ = tree.delete_element(id);
    }
}

fn collect_comments_and_pis(tree: &Tree, node: NodeId, out: &mut Vec<NodeId>) {
    for &c in &tree.node(node).children.clone() {
        match tree.node(c).kind {
            NodeKind::Comment(_) | NodeKind::Pi { .. } => out.push(c),
            NodeKind::Element { .. } => collect_comments_and_pis(tree, c, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enveloped_signature_removes_first_signature_only() {
        let xml = format!(
            r#"<Root xmlns:ds="{ns}"><ds:Signature><ds:SignedInfo/></ds:Signature><Content/></Root>"#,
            ns = DSIG_NS
        );
        let mut tree = Tree::parse(&xml).unwrap();
        let step = TransformStep { algorithm: TRANSFORM_ENVELOPED_SIGNATURE.to_string(), inclusive_prefix_list: vec![] };
        let out = apply_transform(&mut tree, TransformOutput::Tree(tree.root), &step).unwrap();
        let root = out.into_tree();
        assert!(tree.find_first_descendant(root, Some(DSIG_NS), "Signature").is_none());
        assert!(tree.find_first_descendant(root, None, "Content").is_some());
    }

    #[test]
    fn unknown_transform_errors() {
        let mut tree = Tree::parse("<Root/>").unwrap();
        let step = TransformStep { algorithm: "urn:unknown".to_string(), inclusive_prefix_list: vec![] };
        let err = apply_transform(&mut tree, TransformOutput::Tree(tree.root), &step).unwrap_err();
        assert!(matches!(err, XmlSigError::UnknownTransform(_)));
    }

    #[test]
    fn strip_comments_and_pis_removes_nested_ones() {
        let mut tree = Tree::parse("<Root><!--c--><A><?pi data?></A></Root>").unwrap();
        strip_comments_and_pis(&mut tree, tree.root);
        let out = canonicalize(&tree, tree.root, false, true, &[]).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("<!--"));
        assert!(!s.contains("<?pi"));
    }
}
