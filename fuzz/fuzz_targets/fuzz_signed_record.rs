#![no_main]

use coinage_core::codec::{
    DepositConfirmationPS, DepositRequestPS, MeltCommitmentPS, SignedRecord, WithdrawRequestPS,
};
use libfuzzer_sys::fuzz_target;

fn check<R: SignedRecord + PartialEq + std::fmt::Debug>(data: &[u8]) {
    // Decoding must never panic; a decoded record re-encodes to the input
    if let Ok(record) = R::decode(data) {
        assert_eq!(record.encode(), data);
    }
}

fuzz_target!(|data: &[u8]| {
    check::<DepositRequestPS>(data);
    check::<DepositConfirmationPS>(data);
    check::<WithdrawRequestPS>(data);
    check::<MeltCommitmentPS>(data);
});
