//! Arvore XML mutavel em memoria
//!
//! Representa o documento como uma arena de nos indexados por `NodeId`, para
//! que a identidade de um no sobreviva a mutacoes de seus irmaos (remocao de
//! elementos, redistribuicao de `tail`) sem lutar contra o borrow checker.
//! Clonar a arvore inteira (`Tree::clone`) produz uma copia profunda legitima,
//! ja que todo o estado vive no `Vec<Node>` — e exatamente o que o Processador
//! de Referencias precisa para operar sobre uma copia do documento por
//! referencia sem afetar o original.

use std::collections::HashMap;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;

use crate::error::{Result, XmlSigError};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N_NS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const XMLNS_ATTR: &str = "xmlns";

/// Indice de um no dentro da arena de uma `Tree`. Estavel enquanto a arvore
/// nao for clonada/descartada; a remocao de um no nao invalida os demais.
pub type NodeId = usize;

/// Nome qualificado, preservando o prefixo literal usado no documento-fonte
/// (necessario para reproduzir o mesmo prefixo na canonicalizacao) e a URI
/// de namespace resolvida a partir do escopo no momento do parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub ns: Option<String>,
    pub local: String,
}

impl QName {
    pub fn unqualified(local: impl Into<String>) -> Self {
        QName { prefix: None, ns: None, local: local.into() }
    }

    /// Nome no namespace `xmldsig`, sem prefixo (documento usa `xmlns=` default).
    pub fn dsig(local: impl Into<String>) -> Self {
        QName { prefix: None, ns: Some(DSIG_NS.to_string()), local: local.into() }
    }

    /// Compara ignorando o prefixo literal: iguais se mesma URI (ou ambas sem URI) e mesmo local-name.
    pub fn matches_ns_local(&self, ns: Option<&str>, local: &str) -> bool {
        self.ns.as_deref() == ns && self.local == local
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Element {
        name: QName,
        /// Declaracoes de namespace feitas diretamente neste elemento (prefixo, uri); prefixo `None` = `xmlns` default.
        ns_decls: Vec<(Option<String>, String)>,
        attrs: Vec<(QName, String)>,
        /// Snapshot do mapeamento prefixo->uri em vigor neste elemento (herdado + proprio).
        ns_scope: Vec<(Option<String>, String)>,
    },
    Comment(String),
    Pi { target: String, data: String },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub text: Option<String>,
    pub tail: Option<String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn as_element(&self) -> Option<(&QName, &[(QName, String)])> {
        match &self.kind {
            NodeKind::Element { name, attrs, .. } => Some((name, attrs)),
            _ => None,
        }
    }

    pub fn is_element_named(&self, ns: Option<&str>, local: &str) -> bool {
        matches!(&self.kind, NodeKind::Element { name, .. } if name.matches_ns_local(ns, local))
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    pub root: NodeId,
}

/// Pilha de um frame por elemento aberto durante o parse.
struct OpenFrame {
    node: NodeId,
    last_child: Option<NodeId>,
}

impl Tree {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Cria um novo no e retorna seu id. O no fica sem pai ate ser anexado
    /// com [`Tree::append_child`] ou [`Tree::insert_child`].
    fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn new_element(&mut self, name: QName) -> NodeId {
        self.push_node(Node {
            kind: NodeKind::Element { name, ns_decls: Vec::new(), attrs: Vec::new(), ns_scope: Vec::new() },
            text: None,
            tail: None,
            children: Vec::new(),
            parent: None,
        })
    }

    pub fn set_attr(&mut self, id: NodeId, name: QName, value: impl Into<String>) {
        if let NodeKind::Element { attrs, .. } = &mut self.node_mut(id).kind {
            attrs.push((name, value.into()));
        }
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        self.node_mut(id).text = Some(text.into());
    }

    /// Anexa `child` como ultimo filho de `parent`.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Insere `child` como filho de `parent` na posicao `index`.
    pub fn insert_child_at(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(index, child);
    }

    /// Insere `new_node` imediatamente apos `after` na lista de filhos do pai de `after`.
    pub fn insert_after(&mut self, after: NodeId, new_node: NodeId) -> Result<()> {
        let parent = self.nodes[after]
            .parent
            .ok_or_else(|| XmlSigError::CanonicalizationError("no insere apos a raiz".into()))?;
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == after)
            .expect("after deve ser filho do seu proprio parent");
        self.insert_child_at(parent, pos + 1, new_node);
        Ok(())
    }

    /// Busca em pre-ordem (ordem de documento) todos os descendentes (elemento)
    /// de `start` cujo nome combina com `ns`/`local`. Inclui `start` em si.
    pub fn find_descendants<'a>(&'a self, start: NodeId, ns: Option<&'a str>, local: &'a str) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_preorder(start, &mut |id| {
            if self.nodes[id].is_element_named(ns, local) {
                out.push(id);
            }
        });
        out
    }

    pub fn find_first_descendant(&self, start: NodeId, ns: Option<&str>, local: &str) -> Option<NodeId> {
        self.find_descendants(start, ns, local).into_iter().next()
    }

    fn walk_preorder(&self, start: NodeId, f: &mut impl FnMut(NodeId)) {
        f(start);
        for &c in &self.nodes[start].children {
            self.walk_preorder(c, f);
        }
    }

    /// Todos os nos do documento (qualquer tipo) em ordem de documento, a partir da raiz.
    pub fn preorder_all(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_preorder(self.root, &mut |id| out.push(id));
        out
    }

    /// Procura, em todo o documento, um elemento cujo atributo de nome local
    /// `attr_local` (sem namespace) tenha valor `id_value`. Busca na ordem de
    /// documento; o primeiro nome de atributo que casar na lista `id_attrs`
    /// (em ordem) e usado antes de tentar o proximo.
    pub fn find_by_id_attr(&self, id_attrs: &[String], id_value: &str) -> Option<NodeId> {
        for attr_local in id_attrs {
            let found = self.preorder_all().into_iter().find_map(|id| match &self.nodes[id].kind {
                NodeKind::Element { attrs, .. } => attrs
                    .iter()
                    .find(|(name, v)| name.ns.is_none() && &name.local == attr_local && v == id_value)
                    .map(|_| id),
                _ => None,
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Remove `elt` da arvore, preservando a concatenacao de texto: o `tail`
    /// do no removido e anexado ao `tail` do irmao anterior, ou, se nao
    /// houver irmao anterior, ao `text` do pai. Falha se `elt` for a raiz.
    pub fn delete_element(&mut self, elt: NodeId) -> Result<()> {
        let parent = self.nodes[elt]
            .parent
            .ok_or_else(|| XmlSigError::CanonicalizationError("nao e possivel remover a raiz".into()))?;
        let tail = self.nodes[elt].tail.take();
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == elt)
            .expect("elt deve ser filho do seu proprio parent");

        if let Some(tail) = tail {
            if pos > 0 {
                let prev = self.nodes[parent].children[pos - 1];
                let buf = self.nodes[prev].tail.get_or_insert_with(String::new);
                buf.push_str(&tail);
            } else {
                let buf = self.nodes[parent].text.get_or_insert_with(String::new);
                buf.push_str(&tail);
            }
        }
        self.nodes[parent].children.remove(pos);
        Ok(())
    }

    // ---------------------------------------------------------------- parse

    /// Faz o parse de `xml`, normalizando espacos em branco somente
    /// estruturais (equivalente ao `remove_blank_text` do lxml usado pelo
    /// parser original): texto composto so de espacos entre tags de um
    /// elemento que tambem possui filhos elemento/comentario/PI e descartado;
    /// texto-folha (elemento sem filhos) e sempre preservado, mesmo se so
    /// espacos, pois pode ser dado significativo.
    pub fn parse(xml: &str) -> Result<Tree> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut nodes: Vec<Node> = Vec::new();
        let mut root: Option<NodeId> = None;
        let mut stack: Vec<OpenFrame> = Vec::new();
        let mut ns_stack: Vec<HashMap<Option<String>, String>> = vec![HashMap::new()];
        let mut pending_text = String::new();
        let mut buf = Vec::new();

        let flush_text =
            |nodes: &mut Vec<Node>, stack: &[OpenFrame], pending: &mut String| {
                if pending.is_empty() {
                    return;
                }
                if let Some(frame) = stack.last() {
                    match frame.last_child {
                        Some(child) => {
                            nodes[child].tail.get_or_insert_with(String::new).push_str(pending);
                        }
                        None => {
                            nodes[frame.node].text.get_or_insert_with(String::new).push_str(pending);
                        }
                    }
                }
                pending.clear();
            };

        loop {
            match reader.read_event_into(&mut buf).map_err(XmlSigError::Xml)? {
                Event::Start(e) => {
                    flush_text(&mut nodes, &stack, &mut pending_text);
                    let parent_scope = ns_stack.last().cloned().unwrap_or_default();
                    let (name, ns_decls, attrs, scope) = parse_start(&e, &parent_scope)?;
                    let node_id = nodes.len();
                    nodes.push(Node {
                        kind: NodeKind::Element { name, ns_decls, attrs, ns_scope: sorted_scope(&scope) },
                        text: None,
                        tail: None,
                        children: Vec::new(),
                        parent: stack.last().map(|f| f.node),
                    });
                    attach_child(&mut nodes, &mut stack, &mut root, node_id);
                    stack.push(OpenFrame { node: node_id, last_child: None });
                    ns_stack.push(scope);
                }
                Event::Empty(e) => {
                    flush_text(&mut nodes, &stack, &mut pending_text);
                    let parent_scope = ns_stack.last().cloned().unwrap_or_default();
                    let (name, ns_decls, attrs, scope) = parse_start(&e, &parent_scope)?;
                    let node_id = nodes.len();
                    nodes.push(Node {
                        kind: NodeKind::Element { name, ns_decls, attrs, ns_scope: sorted_scope(&scope) },
                        text: None,
                        tail: None,
                        children: Vec::new(),
                        parent: stack.last().map(|f| f.node),
                    });
                    attach_child(&mut nodes, &mut stack, &mut root, node_id);
                }
                Event::End(_e) => {
                    flush_text(&mut nodes, &stack, &mut pending_text);
                    stack.pop();
                    ns_stack.pop();
                }
                Event::Text(e) => {
                    pending_text.push_str(&decode_text(&e)?);
                }
                Event::CData(e) => {
                    pending_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
                Event::Comment(e) => {
                    flush_text(&mut nodes, &stack, &mut pending_text);
                    let text = decode_bytes(e.as_ref())?;
                    let node_id = nodes.len();
                    nodes.push(Node {
                        kind: NodeKind::Comment(text),
                        text: None,
                        tail: None,
                        children: Vec::new(),
                        parent: stack.last().map(|f| f.node),
                    });
                    attach_child(&mut nodes, &mut stack, &mut root, node_id);
                }
                Event::PI(e) => {
                    flush_text(&mut nodes, &stack, &mut pending_text);
                    let raw = decode_bytes(e.as_ref())?;
                    let (target, data) = raw.split_once(char::is_whitespace).unwrap_or((raw.as_str(), ""));
                    let node_id = nodes.len();
                    nodes.push(Node {
                        kind: NodeKind::Pi { target: target.to_string(), data: data.trim_start().to_string() },
                        text: None,
                        tail: None,
                        children: Vec::new(),
                        parent: stack.last().map(|f| f.node),
                    });
                    attach_child(&mut nodes, &mut stack, &mut root, node_id);
                }
                Event::Decl(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| XmlSigError::MissingElement("elemento raiz".into()))?;
        let mut tree = Tree { nodes, root };
        tree.strip_structural_whitespace(root);
        Ok(tree)
    }

    /// Remove texto/tail somente-espaco entre tags de elementos que tem
    /// filhos (elemento/comentario/PI); preserva texto-folha intacto.
    fn strip_structural_whitespace(&mut self, node: NodeId) {
        let children = self.nodes[node].children.clone();
        if !children.is_empty() {
            if matches!(self.nodes[node].text.as_deref(), Some(t) if is_ascii_whitespace(t)) {
                self.nodes[node].text = None;
            }
            for &c in &children {
                if matches!(self.nodes[c].tail.as_deref(), Some(t) if is_ascii_whitespace(t)) {
                    self.nodes[c].tail = None;
                }
            }
        }
        for c in children {
            self.strip_structural_whitespace(c);
        }
    }

    // -------------------------------------------------------------- output

    /// Serializa a arvore inteira de volta para XML bem formado (nao
    /// canonico): usado para devolver o documento assinado ao chamador.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut out = String::new();
        self.write_node(self.root, &mut out);
        Ok(out)
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::Pi { target, data } => {
                out.push('<');
                out.push('?');
                out.push_str(target);
                if !data.is_empty() {
                    out.push(' ');
                    out.push_str(data);
                }
                out.push_str("?>");
            }
            NodeKind::Element { name, ns_decls, attrs, .. } => {
                out.push('<');
                push_qname(out, name);
                for (prefix, uri) in ns_decls {
                    out.push(' ');
                    match prefix {
                        Some(p) => {
                            out.push_str("xmlns:");
                            out.push_str(p);
                        }
                        None => out.push_str(XMLNS_ATTR),
                    }
                    out.push_str("=\"");
                    out.push_str(&escape_attr(uri));
                    out.push('"');
                }
                for (aname, avalue) in attrs {
                    out.push(' ');
                    push_qname(out, aname);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(avalue));
                    out.push('"');
                }
                if node.children.is_empty() && node.text.is_none() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    if let Some(t) = &node.text {
                        out.push_str(&escape_text(t));
                    }
                    for &c in &node.children {
                        self.write_node(c, out);
                        if let Some(t) = &self.nodes[c].tail {
                            out.push_str(&escape_text(t));
                        }
                    }
                    out.push_str("</");
                    push_qname(out, name);
                    out.push('>');
                }
            }
        }
    }
}

fn push_qname(out: &mut String, name: &QName) {
    if let Some(p) = &name.prefix {
        out.push_str(p);
        out.push(':');
    }
    out.push_str(&name.local);
}

fn attach_child(nodes: &mut [Node], stack: &mut [OpenFrame], root: &mut Option<NodeId>, node_id: NodeId) {
    match stack.last_mut() {
        Some(frame) => {
            nodes[frame.node].children.push(node_id);
            frame.last_child = Some(node_id);
        }
        None => *root = Some(node_id),
    }
}

fn sorted_scope(scope: &HashMap<Option<String>, String>) -> Vec<(Option<String>, String)> {
    let mut v: Vec<_> = scope.iter().map(|(k, val)| (k.clone(), val.clone())).collect();
    v.sort_by(|a, b| a.0.clone().unwrap_or_default().cmp(&b.0.clone().unwrap_or_default()));
    v
}

fn is_ascii_whitespace(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c == ' ' || c == '\t' || c == '\r' || c == '\n')
}

fn decode_bytes(raw: &[u8]) -> Result<String> {
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn decode_text(e: &BytesText) -> Result<String> {
    let unescaped = e.unescape().map_err(XmlSigError::Xml)?;
    Ok(unescaped.into_owned())
}

/// Faz o parse dos atributos de um `Start`/`Empty`, separando declaracoes de
/// namespace (`xmlns`/`xmlns:prefix`) dos atributos normais, e resolve os
/// nomes qualificados (elemento e atributos) contra o escopo resultante.
fn parse_start(
    e: &BytesStart,
    parent_scope: &HashMap<Option<String>, String>,
) -> Result<(QName, Vec<(Option<String>, String)>, Vec<(QName, String)>, HashMap<Option<String>, String>)> {
    let mut ns_decls = Vec::new();
    let mut raw_attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlSigError::Xml(quick_xml::Error::InvalidAttr(e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(XmlSigError::Xml)?.into_owned();
        if key == XMLNS_ATTR {
            ns_decls.push((None, value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            ns_decls.push((Some(prefix.to_string()), value));
        } else {
            raw_attrs.push((key, value));
        }
    }

    let mut scope = parent_scope.clone();
    for (prefix, uri) in &ns_decls {
        scope.insert(prefix.clone(), uri.clone());
    }

    let raw_name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let name = resolve_element_name(&raw_name, &scope);

    let mut attrs = Vec::with_capacity(raw_attrs.len());
    for (key, value) in raw_attrs {
        attrs.push((resolve_attr_name(&key, &scope), value));
    }

    Ok((name, ns_decls, attrs, scope))
}

fn resolve_element_name(raw: &str, scope: &HashMap<Option<String>, String>) -> QName {
    match raw.split_once(':') {
        Some((prefix, local)) => QName {
            ns: scope.get(&Some(prefix.to_string())).cloned(),
            prefix: Some(prefix.to_string()),
            local: local.to_string(),
        },
        None => QName { prefix: None, ns: scope.get(&None).cloned(), local: raw.to_string() },
    }
}

fn resolve_attr_name(raw: &str, scope: &HashMap<Option<String>, String>) -> QName {
    match raw.split_once(':') {
        Some((prefix, local)) => QName {
            ns: scope.get(&Some(prefix.to_string())).cloned(),
            prefix: Some(prefix.to_string()),
            local: local.to_string(),
        },
        // atributos sem prefixo nunca herdam o namespace default (XML Namespaces 1.0 ??5.2)
        None => QName { prefix: None, ns: None, local: raw.to_string() },
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let tree = Tree::parse(r#"<Root ID="x"><Content/></Root>"#).unwrap();
        let (name, attrs) = tree.node(tree.root).as_element().unwrap();
        assert_eq!(name.local, "Root");
        assert_eq!(attrs[0].1, "x");
        assert_eq!(tree.node(tree.root).children.len(), 1);
    }

    #[test]
    fn strips_structural_whitespace_but_keeps_leaf_text() {
        let xml = "<Root>\n  <A>value</A>\n  <B>   </B>\n</Root>";
        let tree = Tree::parse(xml).unwrap();
        let root = tree.node(tree.root);
        assert_eq!(root.text, None);
        let a = tree.node(root.children[0]);
        assert_eq!(a.text.as_deref(), Some("value"));
        let b = tree.node(root.children[1]);
        // B has no children, so its whitespace-only text is leaf data and kept.
        assert_eq!(b.text.as_deref(), Some("   "));
    }

    #[test]
    fn delete_element_merges_tail_into_previous_sibling() {
        let xml = "<Root><A/>tailA<B/>tailB<C/>tailC</Root>";
        let mut tree = Tree::parse(xml).unwrap();
        let root_children = tree.node(tree.root).children.clone();
        let b = root_children[1];
        tree.delete_element(b).unwrap();
        let a = root_children[0];
        assert_eq!(tree.node(a).tail.as_deref(), Some("tailAtailB"));
    }

    #[test]
    fn delete_element_with_no_previous_sibling_merges_into_parent_text() {
        let xml = "<Root><A/>tailA</Root>";
        let mut tree = Tree::parse(xml).unwrap();
        let a = tree.node(tree.root).children[0];
        tree.delete_element(a).unwrap();
        assert_eq!(tree.node(tree.root).text.as_deref(), Some("tailA"));
    }

    #[test]
    fn delete_root_fails() {
        let mut tree = Tree::parse("<Root/>").unwrap();
        assert!(tree.delete_element(tree.root).is_err());
    }

    #[test]
    fn find_by_id_attr_respects_attribute_order_and_namespace() {
        let tree = Tree::parse(r#"<Root><A id="a1"/><B ID="b1"/></Root>"#).unwrap();
        let ids = vec!["ID".to_string(), "id".to_string()];
        let found = tree.find_by_id_attr(&ids, "a1").unwrap();
        assert!(tree.node(found).is_element_named(None, "A"));
    }
}
