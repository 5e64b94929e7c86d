//! `REGISTER`'s packed `arg`: a top-bit bidi flag and a 31-bit donation
//! amount sharing one signed 32-bit wire field.

const BIDI_BIT: i32 = i32::MIN;
const DONATION_MASK: i32 = i32::MAX;

/// Packs a bidi flag and donation amount into one `REGISTER` wire argument.
pub const fn pack_register_arg(bidi: bool, donation: i32) -> i32 {
    let masked = donation & DONATION_MASK;
    if bidi {
        masked | BIDI_BIT
    } else {
        masked
    }
}

/// Unpacks a `REGISTER` wire argument into `(bidi, donation)`.
pub const fn unpack_register_arg(arg: i32) -> (bool, i32) {
    (arg & BIDI_BIT != 0, arg & DONATION_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, 0)]
    #[case(true, 10)]
    #[case(true, 0x7fff_ffff)]
    #[case(false, 12345)]
    fn round_trips(#[case] bidi: bool, #[case] donation: i32) {
        assert_eq!(
            unpack_register_arg(pack_register_arg(bidi, donation)),
            (bidi, donation)
        );
    }

    #[test]
    fn a_sink_packs_to_zero_donation_no_bidi_bit() {
        assert_eq!(pack_register_arg(false, 0), 0);
    }
}
