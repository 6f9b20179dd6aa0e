use std::f64::consts;

/// Maximum length of a name or constant token, in bytes.
pub const MAX_NAME: usize = 32;

/// Look up a named constant, `_pi` through `_q`.
///
/// The mathematical constants come from `std::f64::consts`; the physical
/// constants are the exact doubles the model language has always used.
pub fn named_constant(name: &str) -> Option<f64> {
    Some(match name {
        "_pi" => consts::PI,
        "_pi_2" => consts::FRAC_PI_2,
        "_pi_4" => consts::FRAC_PI_4,
        "_1_pi" => consts::FRAC_1_PI,
        "_2_pi" => consts::FRAC_2_PI,
        "_sqrtpi" => consts::PI.sqrt(),
        "_sqrt2pi" => (2.0 * consts::PI).sqrt(),
        "_1_sqrtpi" => consts::FRAC_2_SQRT_PI / 2.0,
        "_2_sqrtpi" => consts::FRAC_2_SQRT_PI,
        "_e" => consts::E,
        "_ln2" => consts::LN_2,
        "_ln10" => consts::LN_10,
        "_log10e" => consts::LOG10_E,
        "_sqrt2" => consts::SQRT_2,
        "_sqrt1_2" => consts::FRAC_1_SQRT_2,
        "_k" => 1.3806485279e-23,   // Boltzmann constant
        "_c" => 2.99792458e8,       // light speed in vacuum
        "_G" => 6.67259e-11,        // gravitational constant
        "_eps0" => 8.854187817e-12, // electric constant
        "_mu0" => 1.2566370614e-6,  // magnetic constant
        "_0C" => 273.15,            // 0 degrees Celsius in Kelvin
        "_NA" => 6.022140857e+23,   // Avogadro constant
        "_R" => 8.314459848,        // gas constant
        "_h" => 6.626070040e-34,    // Planck constant
        "_F" => 9.64853328959e+4,   // Faraday constant
        "_q" => 1.602176620898e-19, // elementary charge
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::named_constant;
    use std::f64::consts;

    #[test]
    fn mathematical_constants() {
        assert_eq!(named_constant("_pi"), Some(consts::PI));
        assert_eq!(named_constant("_pi_2"), Some(1.5707963267948966));
        assert_eq!(named_constant("_pi_4"), Some(consts::FRAC_PI_4));
        assert_eq!(named_constant("_1_pi"), Some(consts::FRAC_1_PI));
        assert_eq!(named_constant("_2_pi"), Some(consts::FRAC_2_PI));
        assert_eq!(named_constant("_sqrtpi"), Some(consts::PI.sqrt()));
        assert_eq!(named_constant("_sqrt2pi"), Some((2.0 * consts::PI).sqrt()));
        assert_eq!(
            named_constant("_1_sqrtpi"),
            Some(consts::FRAC_2_SQRT_PI / 2.0)
        );
        assert_eq!(named_constant("_2_sqrtpi"), Some(consts::FRAC_2_SQRT_PI));
        assert_eq!(named_constant("_e"), Some(consts::E));
        assert_eq!(named_constant("_ln2"), Some(consts::LN_2));
        assert_eq!(named_constant("_ln10"), Some(consts::LN_10));
        assert_eq!(named_constant("_log10e"), Some(consts::LOG10_E));
        assert_eq!(named_constant("_sqrt2"), Some(consts::SQRT_2));
        assert_eq!(named_constant("_sqrt1_2"), Some(consts::FRAC_1_SQRT_2));
    }

    #[test]
    fn physical_constants() {
        assert_eq!(named_constant("_k"), Some(1.3806485279e-23));
        assert_eq!(named_constant("_c"), Some(2.99792458e8));
        assert_eq!(named_constant("_G"), Some(6.67259e-11));
        assert_eq!(named_constant("_eps0"), Some(8.854187817e-12));
        assert_eq!(named_constant("_mu0"), Some(1.2566370614e-6));
        assert_eq!(named_constant("_0C"), Some(273.15));
        assert_eq!(named_constant("_NA"), Some(6.022140857e+23));
        assert_eq!(named_constant("_R"), Some(8.314459848));
        assert_eq!(named_constant("_h"), Some(6.626070040e-34));
        assert_eq!(named_constant("_F"), Some(9.64853328959e+4));
        assert_eq!(named_constant("_q"), Some(1.602176620898e-19));
    }

    #[test]
    fn unknown_names() {
        assert_eq!(named_constant("_eps"), None);
        assert_eq!(named_constant("_eps00"), None);
        assert_eq!(named_constant("pi"), None);
        assert_eq!(named_constant(""), None);
    }
}
