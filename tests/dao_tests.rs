mod common;

use common::{harness, wei};
use xsd_sim::agent::Agent;
use xsd_sim::balance::Balance;
use xsd_sim::chain::ChainClient;
use xsd_sim::config::AgentSettings;
use xsd_sim::dao::{AdvanceOutcome, RedeemOutcome, SHARE_DECIMALS};
use xsd_sim::error::ActionError;

fn xsd(whole: u64) -> Balance {
    Balance::new(wei(whole), 18)
}

#[test]
fn test_redeem_without_coupons_sends_nothing() {
    let h = harness(1);
    let dao = h.dao(h.xsd_cache());
    h.chain.fund_redeemable(wei(100)).unwrap();

    let outcome = dao.redeem(h.accounts[0], 10).unwrap();
    assert_eq!(outcome, RedeemOutcome::NothingToRedeem);
    assert_eq!(h.chain.count_calls("redeemCoupons"), 0);
}

#[test]
fn test_redeem_is_capped_by_redeemable_then_deferred() {
    let h = harness(1);
    let agent = h.accounts[0];
    let dao = h.dao(h.xsd_cache());
    h.chain.grant_coupons(agent, 5, wei(50));
    h.chain.fund_redeemable(wei(30)).unwrap();

    assert_eq!(dao.redeem(agent, 5).unwrap(), RedeemOutcome::Redeemed(xsd(30)));
    assert_eq!(dao.coupon_balance(agent, 5).unwrap(), xsd(20));
    assert_eq!(h.chain.balance_of(h.xsd_address(), agent).unwrap(), wei(30));
    assert!(dao.total_redeemable().unwrap().is_zero());

    assert_eq!(dao.redeem(agent, 5).unwrap(), RedeemOutcome::Deferred);
    assert_eq!(h.chain.count_calls("redeemCoupons"), 1);
}

#[test]
fn test_expired_coupons_cannot_be_redeemed() {
    let h = harness(1);
    let agent = h.accounts[0];
    let dao = h.dao(h.xsd_cache());
    h.chain.grant_coupons(agent, 3, wei(10));
    h.chain.fund_redeemable(wei(10)).unwrap();
    h.chain.set_epoch(3);

    let err = dao.redeem(agent, 3).unwrap_err();
    assert!(matches!(err, ActionError::Reverted { .. }));
    assert!(err.is_recoverable());
}

#[test]
fn test_coupon_bid_burns_principal_and_assigns_expiry() {
    let h = harness(1);
    let agent_addr = h.accounts[0];
    h.fund_xsd(agent_addr, 100);
    let cache = h.xsd_cache();
    let dao = h.dao(cache.clone());
    let supply_before = h.chain.total_supply(h.xsd_address()).unwrap();

    dao.coupon_bid(agent_addr, 90, &xsd(10), &xsd(15)).unwrap();
    assert_eq!(
        h.chain.total_supply(h.xsd_address()).unwrap(),
        supply_before - wei(10)
    );
    // 10% premium, below the bidder's cap
    assert_eq!(dao.coupon_balance(agent_addr, 90).unwrap(), xsd(11));
    assert_eq!(dao.total_coupons().unwrap(), xsd(11));

    let mut agent = Agent::new(
        agent_addr,
        &AgentSettings::default(),
        6,
        18,
        18,
        SHARE_DECIMALS,
    );
    assert_eq!(dao.get_coupon_expirations(&mut agent).unwrap(), 1);
    assert_eq!(agent.coupon_expiries(), &[90]);
    assert_eq!(dao.get_coupon_expirations(&mut agent).unwrap(), 0, "already seen");

    dao.coupon_bid(agent_addr, 90, &xsd(1), &xsd(2)).unwrap();
    dao.coupon_bid(agent_addr, 95, &xsd(1), &xsd(2)).unwrap();
    assert_eq!(dao.get_coupon_expirations(&mut agent).unwrap(), 2);
    assert_eq!(agent.coupon_expiries(), &[90, 95]);
    assert_eq!(agent.coupon_index_seen(), 3);
}

#[test]
fn test_bid_for_a_past_epoch_reverts() {
    let h = harness(1);
    let agent = h.accounts[0];
    h.fund_xsd(agent, 10);
    h.chain.set_epoch(4);
    let dao = h.dao(h.xsd_cache());

    let err = dao.coupon_bid(agent, 4, &xsd(1), &xsd(2)).unwrap_err();
    assert!(matches!(err, ActionError::Reverted { .. }));
    assert!(dao.coupon_bid(agent, 4, &Balance::zero(18), &xsd(2)).is_err());
}

#[test]
fn test_advance_and_reverted_advance() {
    let h = harness(1);
    let advancer = h.accounts[0];
    let dao = h.dao(h.xsd_cache());

    assert!(dao.advance(advancer).unwrap().advanced());
    assert_eq!(dao.epoch().unwrap(), 1);

    h.chain.revert_next("advance", 1);
    let outcome = dao.advance(advancer).unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Reverted { .. }));
    assert_eq!(dao.epoch().unwrap(), 1, "a reverted advance leaves the epoch");
}

#[test]
fn test_advance_above_peg_funds_outstanding_coupons() {
    let h = harness(1);
    let agent = h.accounts[0];
    h.seed_pool(600_000, 500_000);
    h.chain.grant_coupons(agent, 50, wei(1_000));
    let dao = h.dao(h.xsd_cache());

    dao.advance(agent).unwrap();
    let snapshot = dao.snapshot().unwrap();
    assert_eq!(snapshot.epoch, 1);
    // 1% of 500k supply exceeds the 1k outstanding, so all of it is funded
    assert_eq!(snapshot.total_redeemable, xsd(1_000));
    assert_eq!(snapshot.total_coupons, xsd(1_000));

    assert_eq!(dao.redeem(agent, 50).unwrap(), RedeemOutcome::Redeemed(xsd(1_000)));
}

#[test]
fn test_advance_expires_coupons() {
    let h = harness(1);
    let agent = h.accounts[0];
    h.chain.grant_coupons(agent, 1, wei(5));
    let dao = h.dao(h.xsd_cache());

    dao.advance(agent).unwrap();
    assert!(dao.coupon_balance(agent, 1).unwrap().is_zero());
    assert!(dao.total_coupons().unwrap().is_zero());
}

#[test]
fn test_bond_and_unbond() {
    let h = harness(1);
    let agent = h.accounts[0];
    h.fund_xsd(agent, 100);
    let dao = h.dao(h.xsd_cache());

    dao.bond(agent, &xsd(40)).unwrap();
    assert_eq!(dao.shares_of(agent).unwrap(), Balance::new(wei(40), SHARE_DECIMALS));
    assert!(dao.staged_of(agent).unwrap().is_zero());
    assert_eq!(h.chain.count_calls("deposit"), 1);

    dao.unbond(agent, &Balance::new(wei(10), SHARE_DECIMALS)).unwrap();
    assert_eq!(dao.staged_of(agent).unwrap(), xsd(10));
    assert_eq!(dao.shares_of(agent).unwrap(), Balance::new(wei(30), SHARE_DECIMALS));

    // Already staged, so no second deposit
    dao.bond(agent, &xsd(5)).unwrap();
    assert_eq!(h.chain.count_calls("deposit"), 1);
    assert_eq!(dao.staged_of(agent).unwrap(), xsd(5));
    assert_eq!(dao.shares_of(agent).unwrap(), Balance::new(wei(35), SHARE_DECIMALS));

    assert!(dao.unbond(agent, &Balance::zero(SHARE_DECIMALS)).is_err());
}
