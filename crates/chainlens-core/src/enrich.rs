//! Per-transaction facts derived without further node calls: script kinds,
//! addresses, fees and RBF signaling.

use bitcoin::{Address, Amount, Network, Script, Sequence};
use serde::{Deserialize, Serialize};

use crate::types::{ScriptType, TxNode};

/// First match wins.
const SCRIPT_DETECTORS: [(fn(&Script) -> bool, ScriptType); 8] = [
    (Script::is_p2pkh, ScriptType::P2pkh),
    (Script::is_p2sh, ScriptType::P2sh),
    (Script::is_p2wpkh, ScriptType::P2wpkh),
    (Script::is_p2wsh, ScriptType::P2wsh),
    (Script::is_p2tr, ScriptType::P2tr),
    (Script::is_p2pk, ScriptType::P2pk),
    (Script::is_multisig, ScriptType::BareMultisig),
    (Script::is_op_return, ScriptType::OpReturn),
];

#[must_use]
pub fn classify_script(script: &Script) -> ScriptType {
    SCRIPT_DETECTORS
        .iter()
        .find(|(detect, _)| detect(script))
        .map_or(ScriptType::Unknown, |(_, kind)| *kind)
}

/// Address encoding of `script` on `network`; `None` for OP_RETURN, bare
/// multisig and other non-standard scripts.
#[must_use]
pub fn address_for_script(script: &Script, network: Network) -> Option<String> {
    let address = Address::from_script(script, network).ok()?;
    Some(address.to_string())
}

/// Inputs minus outputs. `None` for coinbases, for transactions with an
/// input whose value is still unknown, and when outputs exceed inputs.
#[must_use]
pub fn compute_fee(tx: &TxNode) -> Option<Amount> {
    let spent = tx
        .inputs
        .iter()
        .map(|input| input.value)
        .sum::<Option<Amount>>()?;
    spent.checked_sub(tx.total_output_value())
}

/// sat/vB; zero for a zero-size transaction.
#[must_use]
pub fn compute_feerate(fee: Amount, vsize: u64) -> f64 {
    match vsize {
        0 => 0.0,
        vsize => fee.to_sat() as f64 / vsize as f64,
    }
}

/// BIP-125 opt-in: any input with a sequence below `0xfffffffe`.
#[must_use]
pub fn is_rbf_signaling(tx: &TxNode) -> bool {
    tx.inputs.iter().any(|input| Sequence(input.sequence).is_rbf())
}

/// Non-zero multiple of `unit_sats`.
#[must_use]
pub fn is_round_value(value: Amount, unit_sats: u64) -> bool {
    let sats = value.to_sat();
    unit_sats != 0 && sats != 0 && sats % unit_sats == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxFacts {
    pub fee_sats: Option<u64>,
    pub feerate_sat_vb: Option<f64>,
    pub rbf_signaling: bool,
    pub input_count: usize,
    pub output_count: usize,
    pub confirmed: bool,
}

#[must_use]
pub fn tx_facts(tx: &TxNode) -> TxFacts {
    let fee = compute_fee(tx);
    TxFacts {
        fee_sats: fee.map(Amount::to_sat),
        feerate_sat_vb: fee.map(|fee| compute_feerate(fee, tx.vsize)),
        rbf_signaling: is_rbf_signaling(tx),
        input_count: tx.inputs.len(),
        output_count: tx.outputs.len(),
        confirmed: tx.is_confirmed(),
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::ScriptBuf;

    use super::*;
    use crate::test_util::{coinbase_input, make_input, make_output, make_tx_node};

    const FINAL: u32 = 0xFFFF_FFFF;

    #[test]
    fn fee_and_feerate_from_resolved_inputs() {
        let tx = make_tx_node(
            vec![make_input(Some(60_000), FINAL), make_input(Some(40_000), FINAL)],
            vec![make_output(70_000), make_output(28_600)],
            140,
        );
        let facts = tx_facts(&tx);
        assert_eq!(facts.fee_sats, Some(1_400));
        assert_eq!(facts.feerate_sat_vb, Some(10.0));
        assert_eq!((facts.input_count, facts.output_count), (2, 2));
        assert!(!facts.rbf_signaling);
    }

    #[test]
    fn fee_unknown_without_every_input_value() {
        let partial = make_tx_node(
            vec![make_input(Some(5_000), FINAL), make_input(None, FINAL)],
            vec![make_output(3_000)],
            140,
        );
        assert_eq!(compute_fee(&partial), None);
        assert_eq!(tx_facts(&partial).feerate_sat_vb, None);

        let coinbase = make_tx_node(vec![coinbase_input()], vec![make_output(312_500_000)], 120);
        assert_eq!(compute_fee(&coinbase), None);

        let overspent = make_tx_node(vec![make_input(Some(1_000), FINAL)], vec![make_output(2_000)], 100);
        assert_eq!(compute_fee(&overspent), None);
    }

    #[test]
    fn zero_vsize_feerate_is_zero() {
        assert_eq!(compute_feerate(Amount::from_sat(500), 0), 0.0);
    }

    #[test]
    fn rbf_needs_one_low_sequence() {
        let final_only = make_tx_node(vec![make_input(Some(1), 0xFFFF_FFFE)], vec![], 60);
        assert!(!is_rbf_signaling(&final_only));

        let mixed = make_tx_node(
            vec![make_input(Some(1), FINAL), make_input(Some(1), 0xFFFF_FFFD)],
            vec![],
            60,
        );
        assert!(is_rbf_signaling(&mixed));
    }

    #[test]
    fn round_value_edges() {
        assert!(is_round_value(Amount::from_sat(2_500_000), 100_000));
        assert!(!is_round_value(Amount::from_sat(2_500_001), 100_000));
        assert!(!is_round_value(Amount::ZERO, 100_000));
        assert!(!is_round_value(Amount::from_sat(100_000), 0));
    }

    #[test]
    fn witness_scripts_classify_and_encode() {
        let mut p2wpkh = vec![0x00, 0x14];
        p2wpkh.extend(1..=20u8);
        let script = ScriptBuf::from_bytes(p2wpkh);
        assert_eq!(classify_script(&script), ScriptType::P2wpkh);
        let address = address_for_script(&script, Network::Regtest).expect("p2wpkh has an address");
        assert!(address.starts_with("bcrt1q"));

        let mut p2tr = vec![0x51, 0x20];
        p2tr.extend([7u8; 32]);
        assert_eq!(classify_script(&ScriptBuf::from_bytes(p2tr)), ScriptType::P2tr);
    }

    #[test]
    fn data_carriers_and_junk() {
        let op_return = ScriptBuf::from_bytes(vec![0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(classify_script(&op_return), ScriptType::OpReturn);
        assert!(address_for_script(&op_return, Network::Bitcoin).is_none());

        assert_eq!(classify_script(&ScriptBuf::from_bytes(vec![0xff, 0x01])), ScriptType::Unknown);
    }
}
