//! Exchange client
//!
//! [`ExchangeClient`] owns the configuration, the transport and the current
//! [`KeySet`]. Every network operation validates its arguments first and
//! fails with `CallerError` without touching the network; otherwise it
//! returns a [`PendingRequest`] that resolves to exactly one result.
//!
//! The key set is read-mostly. A key update merges into a fresh value
//! under the write lock and swaps it in, so readers always see a complete
//! set.

use std::sync::Arc;

use coinage_core::{
    Amount, BlindingKeySecret, Coin, CoinPrivateKey, HashCode, PlanchetSecrets,
    ReservePrivateKey, Timestamp,
};
use rand::rngs::OsRng;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::auditor::{build_report, report_to_all, should_report, AuditorClient};
use crate::config::ExchangeConfig;
use crate::deposit::{handle_deposit_response, prepare_deposit, DepositParams, DepositReceipt};
use crate::error::Result;
use crate::keys::KeySet;
use crate::pending::PendingRequest;
use crate::recoup::{build_recoup_request, handle_recoup_response, RecoupReceipt};
use crate::refresh::{
    build_reveal_request, handle_link_response, handle_melt_response, handle_reveal_response,
    melt_request, prepare_melt, LinkedCoin, MeltOutcome, MeltPlan,
};
use crate::retry::send_with_retry;
use crate::transport::{join_url, AuditorConnector, HttpResponse, Transport};
use crate::wire::{to_body, unexpected_reply};
use crate::withdraw::{handle_withdraw_response, prepare_withdraw};

/// Client for one exchange
#[derive(Clone)]
pub struct ExchangeClient {
    config: Arc<ExchangeConfig>,
    transport: Arc<dyn Transport>,
    keys: Arc<RwLock<Arc<KeySet>>>,
    auditors: Option<Arc<dyn AuditorConnector>>,
}

impl ExchangeClient {
    pub fn new(config: ExchangeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let keys = KeySet::with_master(config.master_public_key);
        Ok(Self {
            config: Arc::new(config),
            transport,
            keys: Arc::new(RwLock::new(Arc::new(keys))),
            auditors: None,
        })
    }

    /// Start from a cached key set, trusting it without signature checks
    pub fn from_cache(
        config: ExchangeConfig,
        transport: Arc<dyn Transport>,
        cached: &Value,
    ) -> Result<Self> {
        config.validate()?;
        let keys = KeySet::from_cache(config.master_public_key, cached)?;
        keys.check_currency(config.currency()?)?;
        info!(
            "Loaded cached key set with {} denominations",
            keys.denominations.len()
        );
        Ok(Self {
            config: Arc::new(config),
            transport,
            keys: Arc::new(RwLock::new(Arc::new(keys))),
            auditors: None,
        })
    }

    /// Enable sampled deposit reports to the exchange's auditors
    pub fn with_auditor_connector(mut self, connector: Arc<dyn AuditorConnector>) -> Self {
        self.auditors = Some(connector);
        self
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Snapshot of the current key set
    pub async fn keys(&self) -> Arc<KeySet> {
        self.keys.read().await.clone()
    }

    /// True when the key set is empty or about to expire
    pub async fn needs_key_update(&self, now: Timestamp) -> bool {
        let keys = self.keys().await;
        keys.denominations.is_empty() || keys.needs_refresh(now, self.config.keys_refresh_margin)
    }

    /// `GET /keys`, merged into the current key set
    #[instrument(skip(self), fields(exchange = %self.config.base_url))]
    pub async fn update_keys(&self) -> Result<PendingRequest<Arc<KeySet>>> {
        let client = self.clone();
        Ok(PendingRequest::spawn(async move { client.fetch_keys().await }))
    }

    async fn fetch_keys(&self) -> Result<Arc<KeySet>> {
        let known = self.keys().await;
        // Cherry-pick: only denominations that started after the newest one we hold
        let path = if known.denominations.is_empty() {
            "keys".to_string()
        } else {
            format!(
                "keys?last_issue_date={}",
                known.last_denom_issue_date.as_micros() / 1_000_000
            )
        };
        let url = join_url(&self.config.base_url, &path);
        let response = send_with_retry(&self.config.retry, "keys", || self.transport.get(&url))
            .await?;
        if response.status != 200 {
            return Err(unexpected_reply(&response, "keys"));
        }

        let mut guard = self.keys.write().await;
        let mut merged = guard.merge(&response.body, true)?;
        merged.check_currency(self.config.currency()?)?;
        // Without an Expires header the set is stale at once
        merged.expires = response.expires.unwrap_or_else(Timestamp::now);
        let merged = Arc::new(merged);
        *guard = merged.clone();
        info!(
            "Key set updated: {} denominations, {} signing keys",
            merged.denominations.len(),
            merged.signing_keys.len()
        );
        Ok(merged)
    }

    async fn post(&self, operation: &str, path: &str, body: Value) -> Result<HttpResponse> {
        let url = join_url(&self.config.base_url, path);
        send_with_retry(&self.config.retry, operation, || {
            self.transport.post(&url, &body)
        })
        .await
    }

    async fn get(&self, operation: &str, path: &str) -> Result<HttpResponse> {
        let url = join_url(&self.config.base_url, path);
        send_with_retry(&self.config.retry, operation, || self.transport.get(&url)).await
    }

    /// `POST /coins/{coin_pub}/deposit`
    #[instrument(skip(self, params), fields(coin = %params.coin.coin_pub.short()))]
    pub async fn deposit(&self, params: DepositParams) -> Result<PendingRequest<DepositReceipt>> {
        let keys = self.keys().await;
        let prepared = prepare_deposit(&keys, &params)?;
        let body = to_body(&prepared.request)?;
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.post("deposit", &prepared.path(), body).await?;
            let receipt = handle_deposit_response(&keys, &prepared, &response)?;
            info!(
                "Deposited {} from coin {}",
                prepared.amount,
                prepared.coin_pub.short()
            );

            let sampled = should_report(client.config.auditor_chance, &mut OsRng);
            if let (true, Some(connector)) = (sampled, client.auditors.as_ref()) {
                match build_report(&keys, &prepared, &receipt) {
                    Ok(report) => {
                        let auditors: Vec<AuditorClient> = keys
                            .auditors_for(&prepared.request.denom_pub_hash)
                            .into_iter()
                            .filter_map(|a| {
                                connector.connect(&a.auditor_url).map(|transport| {
                                    AuditorClient::new(
                                        a.auditor_url.clone(),
                                        transport,
                                        client.config.retry.clone(),
                                    )
                                })
                            })
                            .collect();
                        debug!("Reporting deposit to {} auditors", auditors.len());
                        tokio::spawn(report_to_all(auditors, report));
                    }
                    Err(e) => debug!("Skipping auditor report: {}", e),
                }
            }
            Ok(receipt)
        }))
    }

    /// `POST /reserves/{reserve_pub}/withdraw`
    ///
    /// The caller should persist `secrets` before awaiting the result; the
    /// coin cannot be recovered without them.
    #[instrument(skip(self, reserve_priv, secrets))]
    pub async fn withdraw(
        &self,
        h_denom_pub: HashCode,
        reserve_priv: &ReservePrivateKey,
        secrets: PlanchetSecrets,
    ) -> Result<PendingRequest<Coin>> {
        let keys = self.keys().await;
        let prepared = prepare_withdraw(&keys, &h_denom_pub, reserve_priv, secrets, Timestamp::now())?;
        let body = to_body(&prepared.request)?;
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.post("withdraw", &prepared.path(), body).await?;
            handle_withdraw_response(&keys, &prepared, &response)
        }))
    }

    /// Choose transfer keys and compute the commitment for a melt
    pub async fn plan_melt(
        &self,
        old_coin_priv: &CoinPrivateKey,
        old_coin: &Coin,
        melt_amount: &Amount,
        new_denoms: &[HashCode],
    ) -> Result<MeltPlan> {
        let keys = self.keys().await;
        prepare_melt(
            &keys,
            old_coin_priv,
            old_coin,
            melt_amount,
            new_denoms,
            Timestamp::now(),
            &mut OsRng,
        )
    }

    /// `POST /coins/{coin_pub}/melt`
    ///
    /// Safe to repeat with the same plan; the exchange answers with the same
    /// `noreveal_index`.
    #[instrument(skip(self, plan), fields(rc = %plan.rc.short()))]
    pub async fn melt(&self, plan: &MeltPlan) -> Result<PendingRequest<MeltOutcome>> {
        let keys = self.keys().await;
        let body = to_body(&melt_request(plan))?;
        let plan = plan.clone();
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.post("melt", &plan.melt_path(), body).await?;
            handle_melt_response(&keys, &plan, &response)
        }))
    }

    /// `POST /refreshes/{rc}/reveal`
    #[instrument(skip(self, plan, outcome), fields(rc = %plan.rc.short()))]
    pub async fn reveal(
        &self,
        plan: &MeltPlan,
        outcome: &MeltOutcome,
    ) -> Result<PendingRequest<Vec<Coin>>> {
        let body = to_body(&build_reveal_request(plan, outcome)?)?;
        let plan = plan.clone();
        let outcome = *outcome;
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.post("reveal", &plan.reveal_path(), body).await?;
            handle_reveal_response(&plan, &outcome, &response)
        }))
    }

    /// `GET /coins/{coin_pub}/link`
    #[instrument(skip(self, old_coin_priv))]
    pub async fn link(
        &self,
        old_coin_priv: &CoinPrivateKey,
    ) -> Result<PendingRequest<Vec<LinkedCoin>>> {
        let old_coin_priv = old_coin_priv.clone();
        let path = format!("coins/{}/link", old_coin_priv.public_key().to_hex());
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.get("link", &path).await?;
            handle_link_response(&old_coin_priv, &response)
        }))
    }

    /// `POST /coins/{coin_pub}/recoup`
    #[instrument(skip(self, coin, coin_priv, blinding_key))]
    pub async fn recoup(
        &self,
        coin: &Coin,
        coin_priv: &CoinPrivateKey,
        blinding_key: &BlindingKeySecret,
        was_refreshed: bool,
    ) -> Result<PendingRequest<RecoupReceipt>> {
        let keys = self.keys().await;
        let prepared = build_recoup_request(&keys, coin, coin_priv, blinding_key, was_refreshed)?;
        let body = to_body(&prepared.request)?;
        let client = self.clone();

        Ok(PendingRequest::spawn(async move {
            let response = client.post("recoup", &prepared.path(), body).await?;
            handle_recoup_response(&keys, &prepared, &response)
        }))
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolError, TransportError};
    use crate::testing::KeyFixture;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves one canned `/keys` reply and records requests
    struct KeysOnly {
        keys: Mutex<Value>,
        expires: Option<Timestamp>,
        requests: AtomicU32,
        urls: Mutex<Vec<String>>,
    }

    impl KeysOnly {
        fn new(keys: Value, expires: Option<Timestamp>) -> Arc<Self> {
            Arc::new(Self {
                keys: Mutex::new(keys),
                expires,
                requests: AtomicU32::new(0),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for KeysOnly {
        async fn get(&self, url: &str) -> std::result::Result<HttpResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if url.contains("/keys") {
                let mut response = HttpResponse::new(200, self.keys.lock().unwrap().clone());
                response.expires = self.expires;
                Ok(response)
            } else {
                Ok(HttpResponse::new(404, json!({"code": 0, "hint": "not here"})))
            }
        }

        async fn post(
            &self,
            _url: &str,
            _body: &Value,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(500, json!({})))
        }
    }

    fn client(fx: &KeyFixture, expires: Option<Timestamp>) -> (ExchangeClient, Arc<KeysOnly>) {
        let transport = KeysOnly::new(fx.response(), expires);
        let config = ExchangeConfig {
            base_url: "https://exchange.test".to_string(),
            ..Default::default()
        };
        (ExchangeClient::new(config, transport.clone()).unwrap(), transport)
    }

    #[tokio::test]
    async fn test_update_keys_swaps_in_merged_set() {
        let fx = KeyFixture::new(2);
        let expires = Timestamp::from_secs(2_000_000_000);
        let (client, _) = client(&fx, Some(expires));
        assert!(client.needs_key_update(fx.now).await);

        let keys = client.update_keys().await.unwrap().await.unwrap();
        assert_eq!(keys.denominations.len(), 2);
        assert_eq!(keys.expires, expires);
        assert_eq!(*client.keys().await, *keys);
        assert!(!client.needs_key_update(fx.now).await);

        // A second download of the same data changes nothing
        let again = client.update_keys().await.unwrap().await.unwrap();
        assert_eq!(again.denominations, keys.denominations);
    }

    #[tokio::test]
    async fn test_incremental_update_asks_for_newer_denominations() {
        let fx = KeyFixture::new(2);
        let (client, transport) = client(&fx, None);
        let keys = client.update_keys().await.unwrap().await.unwrap();
        client.update_keys().await.unwrap().await.unwrap();

        let newest_start = keys.last_denom_issue_date.as_micros() / 1_000_000;
        assert_eq!(newest_start, 1_699_913_601);
        assert!(keys.last_denom_issue_date < keys.list_issue_date);

        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], "https://exchange.test/keys");
        assert_eq!(
            urls[1],
            format!("https://exchange.test/keys?last_issue_date={}", newest_start)
        );
    }

    #[tokio::test]
    async fn test_foreign_currency_key_set_rejected() {
        let fx = KeyFixture::new(2);
        let transport = KeysOnly::new(fx.response(), None);
        let config = ExchangeConfig {
            base_url: "https://exchange.test".to_string(),
            currency: "EUR".to_string(),
            ..Default::default()
        };
        let client = ExchangeClient::new(config, transport).unwrap();

        let result = client.update_keys().await.unwrap().await;
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
        assert!(client.keys().await.denominations.is_empty());
    }

    #[tokio::test]
    async fn test_missing_expires_means_stale() {
        let fx = KeyFixture::new(1);
        let (client, _) = client(&fx, None);
        let keys = client.update_keys().await.unwrap().await.unwrap();
        assert!(keys.needs_refresh(Timestamp::now(), coinage_core::RelativeTime::ZERO));
    }

    #[tokio::test]
    async fn test_caller_errors_do_not_touch_network() {
        let fx = KeyFixture::new(1);
        let (client, transport) = client(&fx, None);
        let secrets = PlanchetSecrets::generate(&mut OsRng);
        let reserve = ReservePrivateKey::generate(&mut OsRng);
        let result = client
            .withdraw(HashCode::of(b"unknown"), &reserve, secrets)
            .await;
        assert!(matches!(result, Err(ProtocolError::CallerError(_))));
        assert_eq!(transport.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_keys_restore_client() {
        let fx = KeyFixture::new(2);
        let (client, _) = client(&fx, Some(Timestamp::from_secs(2_000_000_000)));
        let keys = client.update_keys().await.unwrap().await.unwrap();

        let cached = keys.to_cache().unwrap();
        let restored = ExchangeClient::from_cache(
            client.config().clone(),
            KeysOnly::new(json!({}), None),
            &cached,
        )
        .unwrap();
        assert_eq!(restored.keys().await.denominations, keys.denominations);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ExchangeConfig {
            currency: "not a currency".to_string(),
            ..Default::default()
        };
        let transport = KeysOnly::new(json!({}), None);
        assert!(matches!(
            ExchangeClient::new(config, transport),
            Err(ProtocolError::CallerError(_))
        ));
    }
}
