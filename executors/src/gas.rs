use txengine_core::config::GasConfig;

/// Compute the replacement gas price for a prior attempt at `previous`.
///
/// The new price is the largest of a percentage bump, a flat increment,
/// and the configured default, clamped to the configured ceiling. Taking
/// the maximum of all three matches the replacement rule common chain-node
/// mempools apply, and lets an operator raise the baseline mid-flight by
/// editing the default.
///
/// Once the ceiling is reached every further bump lands on the ceiling
/// again: the engine will not overpay past it and instead waits for
/// inclusion indefinitely.
pub fn bump_gas(config: &GasConfig, previous: u128) -> u128 {
    let by_percentage = previous
        .saturating_mul(100 + config.bump_percent as u128)
        / 100;
    let by_increment = previous.saturating_add(config.bump_wei);

    let bumped = by_percentage.max(by_increment).max(config.price_default);

    if bumped > config.max_price_wei {
        tracing::warn!(
            bumped_gas_price = bumped,
            max_gas_price = config.max_price_wei,
            "bumped gas price would exceed the configured ceiling, capping"
        );
        return config.max_price_wei;
    }
    bumped
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u128 = 1_000_000_000;

    fn config() -> GasConfig {
        GasConfig {
            price_default: 20 * GWEI,
            bump_percent: 20,
            bump_wei: 5 * GWEI,
            max_price_wei: 1_500 * GWEI,
            bump_threshold: 3,
        }
    }

    #[test]
    fn takes_the_largest_of_percentage_increment_and_default() {
        let config = config();

        // At the default, the flat increment wins over the 20% bump.
        assert_eq!(bump_gas(&config, 20 * GWEI), 25 * GWEI);

        // At higher prices the percentage wins.
        assert_eq!(bump_gas(&config, 100 * GWEI), 120 * GWEI);

        // A stale low price is pulled up to at least the default.
        assert_eq!(bump_gas(&config, 1 * GWEI), 20 * GWEI);
    }

    #[test]
    fn caps_at_the_configured_ceiling() {
        let config = config();

        assert_eq!(bump_gas(&config, 1_499 * GWEI), 1_500 * GWEI);
        // Bumping from the cap stays at the cap.
        assert_eq!(bump_gas(&config, 1_500 * GWEI), 1_500 * GWEI);
    }

    #[test]
    fn does_not_overflow_on_extreme_inputs() {
        let config = GasConfig {
            max_price_wei: u128::MAX,
            ..config()
        };
        assert_eq!(bump_gas(&config, u128::MAX), u128::MAX);
    }
}
