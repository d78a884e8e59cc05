//! Attestor output and the page-facing proof format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The claim as signed by the attestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderClaim {
    pub provider: String,
    pub parameters: String,
    pub owner: String,
    pub timestamp_s: u64,
    #[serde(default)]
    pub context: String,
    pub identifier: String,
    #[serde(default)]
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestorSignatures {
    pub attestor_address: String,
    pub claim_signature: String,
}

/// Raw result of one attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestorProof {
    pub claim: ProviderClaim,
    pub signatures: AttestorSignatures,
    #[serde(default)]
    pub extracted_parameter_values: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub id: String,
    pub url: String,
}

/// A proof as delivered to the page or the callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub identifier: String,
    pub claim_data: ProviderClaim,
    pub signatures: Vec<String>,
    pub witnesses: Vec<Witness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_data: Option<String>,
    #[serde(default)]
    pub extracted_parameter_values: Value,
}

pub fn format_proof(raw: &AttestorProof, witness_url: &str, public_data: Option<&str>) -> Proof {
    Proof {
        identifier: raw.claim.identifier.clone(),
        claim_data: raw.claim.clone(),
        signatures: vec![raw.signatures.claim_signature.clone()],
        witnesses: vec![Witness {
            id: raw.signatures.attestor_address.clone(),
            url: witness_url.to_string(),
        }],
        public_data: public_data.map(str::to_string),
        extracted_parameter_values: raw.extracted_parameter_values.clone(),
    }
}

/// Proofs recorded per request hash in arrival order. The first proof for a
/// hash wins; later ones are discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedProofs {
    entries: Vec<(String, AttestorProof)>,
}

impl GeneratedProofs {
    /// Returns false when `request_hash` already has a proof.
    pub fn record(&mut self, request_hash: &str, proof: AttestorProof) -> bool {
        if self.contains(request_hash) {
            return false;
        }
        self.entries.push((request_hash.to_string(), proof));
        true
    }

    pub fn contains(&self, request_hash: &str) -> bool {
        self.entries.iter().any(|(hash, _)| hash == request_hash)
    }

    pub fn get(&self, request_hash: &str) -> Option<&AttestorProof> {
        self.entries
            .iter()
            .find(|(hash, _)| hash == request_hash)
            .map(|(_, proof)| proof)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(hash, _)| hash.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Template-listed proofs first in template order, then ad-hoc proofs in
/// arrival order.
pub fn order_proofs<'a>(required: &[&str], generated: &'a GeneratedProofs) -> Vec<&'a AttestorProof> {
    let mut ordered: Vec<&AttestorProof> = required
        .iter()
        .filter_map(|hash| generated.get(hash))
        .collect();
    ordered.extend(
        generated
            .entries
            .iter()
            .filter(|(hash, _)| !required.contains(&hash.as_str()))
            .map(|(_, proof)| proof),
    );
    ordered
}

#[cfg(test)]
pub(crate) fn sample_proof(identifier: &str) -> AttestorProof {
    AttestorProof {
        claim: ProviderClaim {
            provider: "http".to_string(),
            parameters: "{}".to_string(),
            owner: "0xowner".to_string(),
            timestamp_s: 1_700_000_000,
            context: String::new(),
            identifier: identifier.to_string(),
            epoch: 1,
        },
        signatures: AttestorSignatures {
            attestor_address: "0xattestor".to_string(),
            claim_signature: format!("0xsig-{identifier}"),
        },
        extracted_parameter_values: Value::Null,
    }
}
