use crate::{AddressClassification, RawTransfer, TransactionClass};

/// Assign an accounting category to a transfer.
///
/// Pure function of the transfer, the owner wallet and the rule set: a rule
/// matches a side of the transfer when its wallet address equals that side's
/// address or its contract address equals the transfer's contract address
/// (case-insensitive). Incoming transfers take the from-side rule's class
/// (default OtherIncome), outgoing transfers the to-side rule's class
/// (default Withdraw). The first matching rule in list order wins.
pub fn classify(
    transfer: &RawTransfer,
    owner_address: &str,
    rules: &[AddressClassification],
) -> TransactionClass {
    let from_rule = find_rule(
        rules,
        &transfer.from_address,
        transfer.contract_address.as_deref(),
    );
    let to_rule = find_rule(
        rules,
        &transfer.to_address,
        transfer.contract_address.as_deref(),
    );

    let incoming = transfer.to_address.eq_ignore_ascii_case(owner_address);

    if incoming {
        from_rule
            .map(|r| r.transaction_class)
            .unwrap_or(TransactionClass::OtherIncome)
    } else {
        to_rule
            .map(|r| r.transaction_class)
            .unwrap_or(TransactionClass::Withdraw)
    }
}

fn find_rule<'a>(
    rules: &'a [AddressClassification],
    counterpart: &str,
    contract: Option<&str>,
) -> Option<&'a AddressClassification> {
    rules.iter().find(|rule| {
        let wallet_match = rule
            .wallet_address
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(counterpart));
        let contract_match = match (rule.contract_address.as_deref(), contract) {
            (Some(rule_contract), Some(transfer_contract)) => {
                rule_contract.eq_ignore_ascii_case(transfer_contract)
            }
            _ => false,
        };
        wallet_match || contract_match
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    const OWNER: &str = "0x00000000000000000000000000000000000000aa";
    const MINTER: &str = "0x00000000000000000000000000000000000000bb";
    const EXCHANGE: &str = "0x00000000000000000000000000000000000000cc";
    const TOKEN: &str = "0x00000000000000000000000000000000000000dd";

    fn transfer(from: &str, to: &str, contract: Option<&str>) -> RawTransfer {
        let now = Utc::now();
        RawTransfer {
            id: "1-t".to_string(),
            wallet_address: OWNER.to_string(),
            block_number: 1,
            hash: "0xhash".to_string(),
            from_address: from.to_string(),
            to_address: to.to_string(),
            value: Decimal::ONE,
            asset: "TOK".to_string(),
            category: "erc20".to_string(),
            contract_address: contract.map(str::to_string),
            decimals: 18,
            timestamp: now,
            transaction_class: None,
            created_at: now,
        }
    }

    fn rule(
        name: &str,
        class: TransactionClass,
        wallet: Option<&str>,
        contract: Option<&str>,
    ) -> AddressClassification {
        AddressClassification::new(
            name,
            class,
            wallet.map(str::to_string),
            contract.map(str::to_string),
        )
    }

    #[test]
    fn test_incoming_matches_from_rule() {
        let rules = vec![rule("minter", TransactionClass::Emission, Some(MINTER), None)];
        let t = transfer(MINTER, OWNER, None);
        assert_eq!(classify(&t, OWNER, &rules), TransactionClass::Emission);
    }

    #[test]
    fn test_incoming_defaults_to_other_income() {
        let t = transfer(EXCHANGE, OWNER, None);
        assert_eq!(classify(&t, OWNER, &[]), TransactionClass::OtherIncome);
    }

    #[test]
    fn test_outgoing_matches_to_rule() {
        let rules = vec![rule("exchange", TransactionClass::Swap, Some(EXCHANGE), None)];
        let t = transfer(OWNER, EXCHANGE, None);
        assert_eq!(classify(&t, OWNER, &rules), TransactionClass::Swap);
    }

    #[test]
    fn test_outgoing_defaults_to_withdraw() {
        let t = transfer(OWNER, EXCHANGE, None);
        assert_eq!(classify(&t, OWNER, &[]), TransactionClass::Withdraw);
    }

    #[test]
    fn test_contract_rule_matches_either_direction() {
        let rules = vec![rule("token", TransactionClass::Uploads, None, Some(TOKEN))];
        let incoming = transfer(MINTER, OWNER, Some(TOKEN));
        assert_eq!(classify(&incoming, OWNER, &rules), TransactionClass::Uploads);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let rules = vec![rule("minter", TransactionClass::Emission, Some(MINTER), None)];
        let t = transfer(&MINTER.to_uppercase(), OWNER, None);
        assert_eq!(classify(&t, OWNER, &rules), TransactionClass::Emission);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            rule("first", TransactionClass::AirDrop, Some(MINTER), None),
            rule("second", TransactionClass::Purchase, Some(MINTER), None),
        ];
        let t = transfer(MINTER, OWNER, None);
        assert_eq!(classify(&t, OWNER, &rules), TransactionClass::AirDrop);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let rules = vec![
            rule("minter", TransactionClass::Emission, Some(MINTER), None),
            rule("token", TransactionClass::Uploads, None, Some(TOKEN)),
        ];
        let t = transfer(MINTER, OWNER, Some(TOKEN));
        let first = classify(&t, OWNER, &rules);
        for _ in 0..10 {
            assert_eq!(classify(&t, OWNER, &rules), first);
        }
    }
}
