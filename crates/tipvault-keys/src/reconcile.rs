//! Fan-out reconciliation
//!
//! A crash between minting a tip key and writing every grant leaves a tip
//! that some expected receivers cannot open. `reconcile` detects that, along
//! with grants nobody expects and content left in clear on an encrypted tip.

use serde::Serialize;
use std::collections::BTreeSet;

use tipvault_core::ReceiverId;

use crate::model::{InternalTip, TipEncryption};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Expected receivers without a grant
    pub missing: BTreeSet<ReceiverId>,
    /// Grants for receivers outside the expected set
    pub unexpected: BTreeSet<ReceiverId>,
    /// Content fields stored in clear although the tip is encrypted
    pub clear_fields: Vec<String>,
}

impl FanOutReport {
    /// Accessible means every expected receiver holds a grant and no
    /// content is in clear.
    pub fn is_accessible(&self) -> bool {
        self.missing.is_empty() && self.clear_fields.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.is_accessible() && self.unexpected.is_empty()
    }
}

pub fn reconcile(tip: &InternalTip) -> FanOutReport {
    let TipEncryption::Encrypted {
        expected, grants, ..
    } = &tip.encryption
    else {
        return FanOutReport::default();
    };

    let granted: BTreeSet<ReceiverId> = grants.keys().cloned().collect();
    let mut report = FanOutReport {
        missing: expected.difference(&granted).cloned().collect(),
        unexpected: granted.difference(expected).cloned().collect(),
        clear_fields: Vec::new(),
    };

    if tip.preview.is_clear() {
        report.clear_fields.push("preview".into());
    }
    for (idx, file) in tip.files.iter().enumerate() {
        for (name, field) in [
            ("name", &file.name),
            ("content_type", &file.content_type),
            ("size", &file.size),
        ] {
            if field.is_clear() {
                report.clear_fields.push(format!("files[{idx}].{name}"));
            }
        }
    }

    if !report.is_clean() {
        tracing::warn!(
            tip_id = %tip.id,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            clear_fields = report.clear_fields.len(),
            "submission fan-out is inconsistent"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SealedField;
    use crate::KeyContext;
    use std::time::Duration;
    use tipvault_core::{TenantSettings, TipId};
    use tipvault_crypto::{generate_keypair, KdfParams};

    fn encrypted_tip(expected: &[&str], granted: &[&str]) -> InternalTip {
        let ctx = KeyContext::new(
            TenantSettings { encryption: true },
            KdfParams::insecure_fast(),
            Duration::from_secs(60),
        );
        let receivers = granted
            .iter()
            .map(|id| (ReceiverId::from(*id), generate_keypair().public_key))
            .collect();
        let created = ctx.tip_keys().create_tip_keys(&receivers).unwrap();

        InternalTip {
            id: TipId::generate(),
            created_at: 0,
            updated_at: 0,
            receivers: expected.iter().map(|id| ReceiverId::from(*id)).collect(),
            encryption: TipEncryption::Encrypted {
                public_key: created.keypair.public_key,
                expected: expected.iter().map(|id| ReceiverId::from(*id)).collect(),
                grants: created.grants,
            },
            preview: SealedField::Sealed {
                ciphertext: vec![1, 2, 3],
            },
            files: Vec::new(),
        }
    }

    #[test]
    fn complete_fan_out_is_clean() {
        let report = reconcile(&encrypted_tip(&["a", "b", "c"], &["a", "b", "c"]));
        assert!(report.is_clean());
    }

    #[test]
    fn partial_fan_out_detected() {
        let report = reconcile(&encrypted_tip(&["a", "b", "c"], &["a"]));
        assert!(!report.is_accessible());
        assert_eq!(
            report.missing,
            [ReceiverId::from("b"), ReceiverId::from("c")].into_iter().collect()
        );
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn stray_grant_detected() {
        let report = reconcile(&encrypted_tip(&["a"], &["a", "z"]));
        assert!(report.is_accessible());
        assert!(!report.is_clean());
        assert!(report.unexpected.contains(&ReceiverId::from("z")));
    }

    #[test]
    fn clear_preview_on_encrypted_tip_detected() {
        let mut tip = encrypted_tip(&["a"], &["a"]);
        tip.preview = SealedField::Clear {
            value: "oops".into(),
        };
        let report = reconcile(&tip);
        assert_eq!(report.clear_fields, vec!["preview".to_string()]);
        assert!(!report.is_accessible());
    }
}
