use std::sync::Arc;

use chrono::NaiveDate;

use super::*;
use crate::billing::{FlakyGateway, PaymentCoordinator, RetryPolicy};
use crate::catalog::{NewSubscriptionType, ResourceCategory, ResourceType, Tier};
use crate::ids::FarmerId;
use crate::notify::RecordingNotifier;
use crate::subscription::PaymentStatus;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn seed_plan(store: &Store, name: &str, tier: Tier) -> SubscriptionTypeId {
    store
        .insert_subscription_type(&NewSubscriptionType {
            name: name.to_string(),
            tier,
            farm_size: "Small".to_string(),
            cost_cents: 150_00,
            max_hardware_nodes: 2,
            max_software_services: 2,
            includes_predictions: false,
            includes_analytics: false,
            description: String::new(),
        })
        .unwrap()
}

fn seed_basic(store: &Store) {
    store
        .insert_resource(&crate::catalog::NewResource {
            name: "Inventory Tracker".to_string(),
            resource_type: ResourceType::Software,
            category: ResourceCategory::Inventory,
            unit_cost_cents: 0,
            is_basic: true,
            active: true,
            description: String::new(),
        })
        .unwrap();
}

struct Fixture {
    lifecycle: Lifecycle,
    store: Arc<Store>,
    notifier: Arc<RecordingNotifier>,
    plan: SubscriptionTypeId,
}

fn fixture(policy: LifecyclePolicy) -> Fixture {
    let store = Arc::new(Store::in_memory().unwrap());
    seed_basic(&store);
    let plan = seed_plan(&store, "Normal", Tier::Normal);
    let notifier = Arc::new(RecordingNotifier::new());
    let lifecycle = Lifecycle::new(
        Arc::clone(&store),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        policy,
    );
    Fixture {
        lifecycle,
        store,
        notifier,
        plan,
    }
}

fn subscribe(fx: &Fixture, farmer: i64, auto_renew: bool, today: NaiveDate) -> FarmerSubscription {
    fx.lifecycle
        .create_subscription(
            &CreateSubscription {
                farmer_id: FarmerId(farmer),
                subscription_type_id: fx.plan,
                duration_months: 1,
                auto_renew,
            },
            today,
        )
        .unwrap()
}

#[test]
fn expire_sweep_marks_and_notifies_exactly_once() {
    let fx = fixture(LifecyclePolicy::default());
    let start = date(2026, 1, 1);
    let sub = subscribe(&fx, 1, false, start);
    assert_eq!(sub.end_date, Some(date(2026, 1, 31)));

    let later = date(2026, 3, 1);
    let report = fx.lifecycle.expire_sweep(later);
    assert_eq!(report.matched, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let reloaded = fx.store.subscription(sub.id).unwrap();
    assert_eq!(reloaded.status, SubscriptionStatus::Expired);
    let sent = fx.notifier.take();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        sent[0],
        Notification::SubscriptionExpired {
            subscription_id,
            expired_on,
            ..
        } if subscription_id == sub.id && expired_on == date(2026, 1, 31)
    ));

    // Expired rows no longer match; re-running is a no-op.
    let report = fx.lifecycle.expire_sweep(later);
    assert_eq!(report.matched, 0);
    assert!(fx.notifier.take().is_empty());
}

#[test]
fn expire_sweep_leaves_current_subscriptions_alone() {
    let fx = fixture(LifecyclePolicy::default());
    let start = date(2026, 1, 1);
    let sub = subscribe(&fx, 1, false, start);

    // End date is inclusive: a subscription ending today is not expired.
    let report = fx.lifecycle.expire_sweep(date(2026, 1, 31));
    assert_eq!(report.matched, 0);
    assert_eq!(
        fx.store.subscription(sub.id).unwrap().status,
        SubscriptionStatus::Active
    );
}

#[test]
fn suspend_sweep_waits_out_the_grace_window() {
    let fx = fixture(LifecyclePolicy {
        activation: ActivationPolicy::PaymentGated,
        ..LifecyclePolicy::default()
    });
    let start = date(2026, 1, 1);
    let sub = subscribe(&fx, 1, true, start);
    assert_eq!(sub.status, SubscriptionStatus::Pending);
    let payments = fx.store.payments_for_subscription(sub.id).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].due_date, Some(start));

    // Within grace: untouched.
    let report = fx.lifecycle.suspend_sweep(date(2026, 1, 8));
    assert_eq!(report.matched, 0);
    assert_eq!(
        fx.store.subscription(sub.id).unwrap().status,
        SubscriptionStatus::Pending
    );

    // Past grace: suspended.
    let report = fx.lifecycle.suspend_sweep(date(2026, 1, 9));
    assert_eq!(report.processed, 1);
    assert_eq!(
        fx.store.subscription(sub.id).unwrap().status,
        SubscriptionStatus::Suspended
    );
}

#[test]
fn reminder_sweep_splits_on_auto_renew() {
    let fx = fixture(LifecyclePolicy::default());
    let start = date(2026, 1, 1);
    let renewing = subscribe(&fx, 1, true, start);
    let lapsing = subscribe(&fx, 2, false, start);

    // Two days before both end dates.
    let report = fx.lifecycle.reminder_sweep(date(2026, 1, 29));
    assert_eq!(report.matched, 2);
    assert_eq!(report.processed, 2);

    let sent = fx.notifier.take();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|n| matches!(
        n,
        Notification::RenewalReminder { subscription_id, amount_cents, .. }
            if *subscription_id == renewing.id && *amount_cents == 150_00
    )));
    assert!(sent.iter().any(|n| matches!(
        n,
        Notification::PaymentReminder { subscription_id, .. }
            if *subscription_id == lapsing.id
    )));
}

#[tokio::test(start_paused = true)]
async fn renewal_sweep_extends_on_successful_charge() {
    let fx = fixture(LifecyclePolicy::default());
    let start = date(2026, 1, 1);
    let sub = subscribe(&fx, 1, true, start);

    let gateway = Arc::new(FlakyGateway::failing(0));
    let billing = PaymentCoordinator::new(
        Arc::clone(&fx.store),
        Arc::clone(&gateway) as _,
        Arc::clone(&fx.notifier) as _,
        RetryPolicy::default(),
    );

    let today = date(2026, 1, 30);
    let report = fx.lifecycle.renewal_sweep(&billing, today).await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let reloaded = fx.store.subscription(sub.id).unwrap();
    assert_eq!(reloaded.status, SubscriptionStatus::Active);
    assert_eq!(reloaded.end_date, Some(date(2026, 3, 2)));

    let payments = fx.store.payments_for_subscription(sub.id).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Completed);
    assert!(payments[0].transaction_id.is_some());

    assert!(fx
        .notifier
        .take()
        .iter()
        .any(|n| matches!(n, Notification::RenewalConfirmation { .. })));
}

#[tokio::test(start_paused = true)]
async fn renewal_sweep_skips_manual_subscriptions() {
    let fx = fixture(LifecyclePolicy::default());
    subscribe(&fx, 1, false, date(2026, 1, 1));

    let gateway = Arc::new(FlakyGateway::failing(0));
    let billing = PaymentCoordinator::new(
        Arc::clone(&fx.store),
        Arc::clone(&gateway) as _,
        Arc::clone(&fx.notifier) as _,
        RetryPolicy::default(),
    );

    let report = fx.lifecycle.renewal_sweep(&billing, date(2026, 1, 30)).await;
    assert_eq!(report.matched, 0);
    assert_eq!(gateway.charges_made(), 0);
}

#[tokio::test(start_paused = true)]
async fn renewal_sweep_leaves_subscription_active_after_exhaustion() {
    let fx = fixture(LifecyclePolicy::default());
    let start = date(2026, 1, 1);
    let sub = subscribe(&fx, 1, true, start);

    let gateway = Arc::new(FlakyGateway::failing(10));
    let billing = PaymentCoordinator::new(
        Arc::clone(&fx.store),
        Arc::clone(&gateway) as _,
        Arc::clone(&fx.notifier) as _,
        RetryPolicy::default(),
    );

    let report = fx.lifecycle.renewal_sweep(&billing, date(2026, 1, 30)).await;
    assert_eq!(report.matched, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(gateway.charges_made(), 3);

    // Un-renewed but untouched; the expiry sweep deals with it later.
    let reloaded = fx.store.subscription(sub.id).unwrap();
    assert_eq!(reloaded.status, SubscriptionStatus::Active);
    assert_eq!(reloaded.end_date, Some(date(2026, 1, 31)));

    let sent = fx.notifier.take();
    assert!(sent
        .iter()
        .any(|n| matches!(n, Notification::AdminRenewalFailure { subscription_id }
            if *subscription_id == sub.id)));
    assert!(sent
        .iter()
        .any(|n| matches!(n, Notification::AdminPaymentExhausted { attempts: 3, .. })));
    assert_eq!(
        sent.iter()
            .filter(|n| matches!(n, Notification::PaymentFailed { .. }))
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn renewal_sweep_does_not_double_charge_a_settled_period() {
    let fx = fixture(LifecyclePolicy::default());
    let sub = subscribe(&fx, 1, true, date(2026, 1, 1));

    let gateway = Arc::new(FlakyGateway::failing(0));
    let billing = PaymentCoordinator::new(
        Arc::clone(&fx.store),
        Arc::clone(&gateway) as _,
        Arc::clone(&fx.notifier) as _,
        RetryPolicy::default(),
    );

    // Charge the period directly, as if a prior run settled the payment
    // but crashed before extending the subscription.
    billing
        .charge_renewal(&fx.store.subscription(sub.id).unwrap(), date(2026, 1, 30))
        .await
        .unwrap();
    assert_eq!(gateway.charges_made(), 1);

    let report = fx.lifecycle.renewal_sweep(&billing, date(2026, 1, 30)).await;
    assert_eq!(report.processed, 1);
    // The sweep recovered the extension without charging again.
    assert_eq!(gateway.charges_made(), 1);
    assert_eq!(
        fx.store.subscription(sub.id).unwrap().end_date,
        Some(date(2026, 3, 2))
    );
    let payments = fx.store.payments_for_subscription(sub.id).unwrap();
    assert_eq!(payments.len(), 1);
}
