//! Canonicalizacao XML (c14n inclusivo e exclusivo)
//!
//! Serializa o subtree enraizado em um no para os bytes exatos que alimentam
//! o digest, seguindo W3C c14n (2001-03-15) ou exclusive-c14n (2001-10). Ao
//! contrario do `canonicalize` simplificado usado em
//! `web/src/certificado/assinatura.rs` (que apenas colapsa espacos entre tags
//! via regex), este percorre a arvore ja estruturada e decide, elemento a
//! elemento, quais declaracoes de namespace precisam ser (re)emitidas.

use crate::error::{Result, XmlSigError};
use crate::tree::{NodeId, NodeKind, QName, Tree};

/// Pos-processa o XML canonicalizado substituindo entidades nomeadas e
/// referencias numericas por seus caracteres literais, preservando somente
/// `&amp;`, `&lt;` e `&gt;` escapados. Reproduz intencionalmente o passo de
/// unescape do `_unescape` original (nao-padrao frente ao c14n puro, mantido
/// por interoperabilidade -- ver Design Notes).
fn unescape_for_interop(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let c = s[i..].chars().next().expect("i esta em um limite de char");
        if c != '&' {
            out.push(c);
            i += c.len_utf8();
            continue;
        }
        if let Some(end) = s[i..].find(';').map(|p| i + p) {
            let entity = &s[i..=end];
            if entity == "&amp;" || entity == "&lt;" || entity == "&gt;" {
                out.push_str(entity);
                i = end + 1;
                continue;
            }
            if let Some(rest) = entity.strip_prefix("&#x").or_else(|| entity.strip_prefix("&#X")) {
                if let Some(hex) = rest.strip_suffix(';') {
                    if let Ok(cp) = u32::from_str_radix(hex, 16) {
                        if let Some(c) = char::from_u32(cp) {
                            out.push(c);
                            i = end + 1;
                            continue;
                        }
                    }
                }
            } else if let Some(rest) = entity.strip_prefix("&#") {
                if let Some(dec) = rest.strip_suffix(';') {
                    if let Ok(cp) = dec.parse::<u32>() {
                        if let Some(c) = char::from_u32(cp) {
                            out.push(c);
                            i = end + 1;
                            continue;
                        }
                    }
                }
            } else if let Some(name) = entity.strip_prefix('&').and_then(|r| r.strip_suffix(';')) {
                if let Some(c) = named_entity(name) {
                    out.push(c);
                    i = end + 1;
                    continue;
                }
            }
        }
        // nome desconhecido ou referencia malformada: deixa como esta
        out.push('&');
        i += 1; // '&' e ASCII, sempre 1 byte
    }
    out
}

fn named_entity(name: &str) -> Option<char> {
    match name {
        "apos" => Some('\''),
        "quot" => Some('"'),
        "nbsp" => Some('\u{00A0}'),
        _ => None,
    }
}

/// Rastreia, durante a recursao de serializacao, quais declaracoes de
/// namespace ja foram emitidas pelo ancestral mais proximo (para decidir o
/// que precisa ser redeclarado a cada elemento).
type RenderedScope = Vec<(Option<String>, String)>;

fn rendered_get<'a>(rendered: &'a RenderedScope, prefix: &Option<String>) -> Option<&'a str> {
    // A declaracao mais proxima (o ancestral mais recente) e a que conta, e e
    // sempre a ultima empurrada na pilha — por isso a busca e da cauda para a cabeca.
    rendered.iter().rev().find(|(p, _)| p == prefix).map(|(_, u)| u.as_str())
}

/// Canonicaliza o subtree `node` e devolve os bytes UTF-8 resultantes.
pub fn canonicalize(
    tree: &Tree,
    node: NodeId,
    exclusive: bool,
    with_comments: bool,
    inclusive_prefix_list: &[String],
) -> Result<Vec<u8>> {
    let mut out = String::new();
    let mut rendered: RenderedScope = Vec::new();
    write_subtree(tree, node, exclusive, with_comments, inclusive_prefix_list, true, &mut rendered, &mut out);

    let unescaped = unescape_for_interop(&out);
    let trimmed = unescaped.trim();
    if !trimmed.starts_with('<') || !trimmed.ends_with('>') {
        return Err(XmlSigError::CanonicalizationError(
            "buffer c14n nao comeca com '<' ou nao termina com '>'".into(),
        ));
    }
    Ok(trimmed.as_bytes().to_vec())
}

fn write_subtree(
    tree: &Tree,
    node: NodeId,
    exclusive: bool,
    with_comments: bool,
    inclusive_prefix_list: &[String],
    is_apex: bool,
    rendered: &mut RenderedScope,
    out: &mut String,
) {
    let n = tree.node(node);
    match &n.kind {
        NodeKind::Comment(text) => {
            if with_comments {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
        }
        NodeKind::Pi { target, data } => {
            out.push_str("<?");
            out.push_str(target);
            if !data.is_empty() {
                out.push(' ');
                out.push_str(data);
            }
            out.push_str("?>");
        }
        NodeKind::Element { name, attrs, ns_scope, .. } => {
            out.push('<');
            push_qname(out, name);

            let candidates = candidate_namespaces(name, attrs, ns_scope, exclusive, is_apex, inclusive_prefix_list);
            let saved_len = rendered.len();
            for (prefix, uri) in &candidates {
                if rendered_get(rendered, prefix) != Some(uri.as_str()) {
                    out.push(' ');
                    match prefix {
                        Some(p) => {
                            out.push_str("xmlns:");
                            out.push_str(p);
                        }
                        None => out.push_str("xmlns"),
                    }
                    out.push_str("=\"");
                    out.push_str(uri);
                    out.push('"');
                    rendered.push((prefix.clone(), uri.clone()));
                }
            }

            let mut sorted_attrs: Vec<&(QName, String)> = attrs.iter().collect();
            sorted_attrs.sort_by(|a, b| {
                let ka = (a.0.ns.clone().unwrap_or_default(), a.0.local.clone());
                let kb = (b.0.ns.clone().unwrap_or_default(), b.0.local.clone());
                ka.cmp(&kb)
            });
            for (aname, avalue) in sorted_attrs {
                out.push(' ');
                push_qname(out, aname);
                out.push_str("=\"");
                out.push_str(&c14n_escape_attr(avalue));
                out.push('"');
            }
            out.push('>');

            if let Some(t) = &n.text {
                out.push_str(&c14n_escape_text(t));
            }
            for &c in &n.children {
                write_subtree(tree, c, exclusive, with_comments, inclusive_prefix_list, false, rendered, out);
                if let Some(t) = &tree.node(c).tail {
                    out.push_str(&c14n_escape_text(t));
                }
            }
            out.push_str("</");
            push_qname(out, name);
            out.push('>');

            rendered.truncate(saved_len);
        }
    }
}

/// Decide quais pares (prefixo, uri) devem ser candidatos a declaracao nesse
/// elemento: para c14n inclusivo, todo o escopo em vigor; para exclusivo,
/// apenas os prefixos efetivamente utilizados pelo elemento ou seus
/// atributos, mais a lista `InclusiveNamespaces` no elemento apex.
fn candidate_namespaces(
    name: &QName,
    attrs: &[(QName, String)],
    ns_scope: &[(Option<String>, String)],
    exclusive: bool,
    is_apex: bool,
    inclusive_prefix_list: &[String],
) -> Vec<(Option<String>, String)> {
    if !exclusive {
        return ns_scope.to_vec();
    }

    let mut utilized: Vec<Option<String>> = Vec::new();
    let name_uses_default = name.prefix.is_none() && name.ns.is_some();
    if name.prefix.is_some() || name_uses_default {
        utilized.push(name.prefix.clone());
    }
    for (a, _) in attrs {
        if a.prefix.is_some() {
            utilized.push(a.prefix.clone());
        }
    }
    if is_apex {
        for p in inclusive_prefix_list {
            utilized.push(Some(p.clone()));
        }
    }
    utilized.sort();
    utilized.dedup();

    utilized
        .into_iter()
        .filter_map(|prefix| ns_scope.iter().find(|(p, _)| *p == prefix).cloned())
        .collect()
}

fn push_qname(out: &mut String, name: &QName) {
    if let Some(p) = &name.prefix {
        out.push_str(p);
        out.push(':');
    }
    out.push_str(&name.local);
}

fn c14n_escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('\r', "&#xD;")
}

fn c14n_escape_attr(s: &str) -> String {
    c14n_escape_text(s)
        .replace('"', "&quot;")
        .replace('\t', "&#x9;")
        .replace('\n', "&#xA;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_on_reparsed_output() {
        let tree = Tree::parse(r#"<a:Root xmlns:a="urn:a" X="1" A="2"><a:Child/></a:Root>"#).unwrap();
        let first = canonicalize(&tree, tree.root, false, false, &[]).unwrap();
        let reparsed = Tree::parse(std::str::from_utf8(&first).unwrap()).unwrap();
        let second = canonicalize(&reparsed, reparsed.root, false, false, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn attributes_sorted_by_namespace_then_local_name() {
        let tree = Tree::parse(r#"<Root X="1" A="2"/>"#).unwrap();
        let out = canonicalize(&tree, tree.root, false, false, &[]).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.find("A=\"2\"").unwrap() < s.find("X=\"1\"").unwrap());
    }

    #[test]
    fn exclusive_c14n_drops_unused_prefix() {
        let tree = Tree::parse(r#"<Root xmlns:unused="urn:unused" xmlns:a="urn:a"><a:Child/></Root>"#).unwrap();
        let out = canonicalize(&tree, tree.root, true, false, &[]).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("unused"));
        assert!(s.contains("xmlns:a=\"urn:a\""));
    }

    #[test]
    fn comments_dropped_unless_with_comments() {
        let tree = Tree::parse("<Root><!--hi--><A/></Root>").unwrap();
        let without = canonicalize(&tree, tree.root, true, false, &[]).unwrap();
        assert!(!String::from_utf8(without).unwrap().contains("hi"));
        let with = canonicalize(&tree, tree.root, true, true, &[]).unwrap();
        assert!(String::from_utf8(with).unwrap().contains("<!--hi-->"));
    }

    #[test]
    fn starts_and_ends_with_angle_brackets() {
        let tree = Tree::parse("<Root/>").unwrap();
        let out = canonicalize(&tree, tree.root, false, false, &[]).unwrap();
        assert_eq!(out[0], b'<');
        assert_eq!(*out.last().unwrap(), b'>');
    }

    #[test]
    fn preserves_multibyte_utf8_text() {
        let tree = Tree::parse("<A>café日本語</A>").unwrap();
        let out = canonicalize(&tree, tree.root, false, false, &[]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "<A>café日本語</A>");
    }
}
