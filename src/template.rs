//! Template de assinatura e constantes de algoritmo
//!
//! Monta a estrutura `<Signature>` minima usada como ponto de partida de
//! `sign` quando o documento ainda nao possui uma, espelhando
//! `_enveloped_signature_template`/`add_enveloped_signature` do motor
//! original.

use crate::tree::{NodeId, QName, Tree, DSIG_NS};

pub const C14N_INCLUSIVE: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n";
pub const C14N_EXCLUSIVE_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const TRANSFORM_ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub const SIGNATURE_METHOD_RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const SIGNATURE_METHOD_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SIGNATURE_METHOD_RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub const SIGNATURE_METHOD_RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

pub const DIGEST_METHOD_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";

/// Parametros de construcao de um template de assinatura; todos tem default
/// por §4.7.
pub struct TemplateOptions {
    pub c14n_method: String,
    pub signature_method: String,
    pub digest_method: String,
    pub transforms: Vec<String>,
    pub reference_uri: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        TemplateOptions {
            c14n_method: C14N_INCLUSIVE.to_string(),
            signature_method: SIGNATURE_METHOD_RSA_SHA1.to_string(),
            digest_method: DIGEST_METHOD_SHA1.to_string(),
            transforms: vec![TRANSFORM_ENVELOPED_SIGNATURE.to_string(), C14N_EXCLUSIVE_WITH_COMMENTS.to_string()],
            reference_uri: String::new(),
        }
    }
}

/// Constroi um `<Signature>` vazio (sem `<SignatureValue>` nem `<KeyInfo>`
/// ainda) e o retorna, sem ainda anexa-lo a arvore.
pub fn build_signature_template(tree: &mut Tree, opts: &TemplateOptions) -> NodeId {
    let signature = tree.new_element(QName::dsig("Signature"));

    let signed_info = tree.new_element(QName::dsig("SignedInfo"));
    tree.append_child(signature, signed_info);

    let c14n_method = tree.new_element(QName::dsig("CanonicalizationMethod"));
    tree.set_attr(c14n_method, QName::unqualified("Algorithm"), opts.c14n_method.clone());
    tree.append_child(signed_info, c14n_method);

    let sig_method = tree.new_element(QName::dsig("SignatureMethod"));
    tree.set_attr(sig_method, QName::unqualified("Algorithm"), opts.signature_method.clone());
    tree.append_child(signed_info, sig_method);

    let reference = tree.new_element(QName::dsig("Reference"));
    tree.set_attr(reference, QName::unqualified("URI"), opts.reference_uri.clone());
    tree.append_child(signed_info, reference);

    if !opts.transforms.is_empty() {
        let transforms = tree.new_element(QName::dsig("Transforms"));
        tree.append_child(reference, transforms);
        for alg in &opts.transforms {
            let transform = tree.new_element(QName::dsig("Transform"));
            tree.set_attr(transform, QName::unqualified("Algorithm"), alg.clone());
            tree.append_child(transforms, transform);
        }
    }

    let digest_method = tree.new_element(QName::dsig("DigestMethod"));
    tree.set_attr(digest_method, QName::unqualified("Algorithm"), opts.digest_method.clone());
    tree.append_child(reference, digest_method);

    let digest_value = tree.new_element(QName::dsig("DigestValue"));
    tree.append_child(reference, digest_value);

    signature
}

/// Anexa um `<SignatureValue>{value}</SignatureValue>` logo apos `SignedInfo`.
pub fn append_signature_value(tree: &mut Tree, signature: NodeId, signed_info: NodeId, base64_value: &str) -> NodeId {
    let sig_value = tree.new_element(QName::dsig("SignatureValue"));
    tree.set_text(sig_value, base64_value.to_string());
    let _ = signature;
    tree.insert_after(signed_info, sig_value).expect("SignedInfo deve ter pai Signature");
    sig_value
}

/// Anexa `<KeyInfo><X509Data><X509Certificate>{cert_base64}</X509Certificate></X509Data></KeyInfo>` apos `after`.
pub fn append_key_info(tree: &mut Tree, after: NodeId, cert_base64: &str) -> NodeId {
    let key_info = tree.new_element(QName::dsig("KeyInfo"));
    let x509_data = tree.new_element(QName::dsig("X509Data"));
    let x509_cert = tree.new_element(QName::dsig("X509Certificate"));
    tree.set_text(x509_cert, cert_base64.to_string());
    tree.append_child(x509_data, x509_cert);
    tree.append_child(key_info, x509_data);
    tree.insert_after(after, key_info).expect("after deve ter pai valido");
    key_info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_has_expected_structure() {
        let mut tree = Tree::parse("<Root/>").unwrap();
        let opts = TemplateOptions::default();
        let signature = build_signature_template(&mut tree, &opts);
        let signed_info = tree.find_first_descendant(signature, Some(DSIG_NS), "SignedInfo").unwrap();
        assert!(tree.find_first_descendant(signed_info, Some(DSIG_NS), "CanonicalizationMethod").is_some());
        let reference = tree.find_first_descendant(signed_info, Some(DSIG_NS), "Reference").unwrap();
        let transforms = tree.find_descendants(reference, Some(DSIG_NS), "Transform");
        assert_eq!(transforms.len(), 2);
        assert!(tree.find_first_descendant(reference, Some(DSIG_NS), "DigestValue").is_some());
    }

    #[test]
    fn signature_value_and_key_info_are_inserted_in_order() {
        let mut tree = Tree::parse("<Root/>").unwrap();
        let opts = TemplateOptions::default();
        let signature = build_signature_template(&mut tree, &opts);
        let signed_info = tree.find_first_descendant(signature, Some(DSIG_NS), "SignedInfo").unwrap();
        let sig_value = append_signature_value(&mut tree, signature, signed_info, "abcd");
        append_key_info(&mut tree, sig_value, "ZGVy");

        let children = tree.node(signature).children.clone();
        let names: Vec<&str> = children
            .iter()
            .map(|&c| tree.node(c).as_element().unwrap().0.local.as_str())
            .collect();
        assert_eq!(names, vec!["SignedInfo", "SignatureValue", "KeyInfo"]);
    }
}
