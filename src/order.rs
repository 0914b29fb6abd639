//! Order form, validated order, and the text renderings the sinks need.
//!
//! [`OrderForm`] is the editable side: plain strings as typed. It becomes an
//! immutable [`Order`] only through [`OrderForm::validate`], which is the
//! single place required-field rules live.

use crate::error::FormError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Telegram rejects document captions longer than this.
pub const CAPTION_LIMIT: usize = 1024;

/// File name used when the customer name yields no usable characters.
pub const FALLBACK_FILENAME: &str = "ela_pro_final.png";

/// Raw form values, exactly as entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderForm {
    pub customer_name: String,
    pub product: String,
    /// Text engraved on the reverse side.
    pub back_text: String,
    pub payment_method: String,
    pub currency: String,
    pub amount: String,
    pub reference: String,
    pub delivery_mode: String,
    pub address: String,
    pub phone: String,
}

impl OrderForm {
    /// Check required fields and freeze the form into an [`Order`].
    ///
    /// Customer name and amount are required; the amount must parse as a
    /// non-negative number (a decimal comma is accepted). Every other field
    /// is optional and only trimmed.
    pub fn validate(&self) -> Result<Order, FormError> {
        let customer_name = self.customer_name.trim();
        if customer_name.is_empty() {
            return Err(FormError::MissingCustomerName);
        }

        let amount = self.amount.trim();
        if amount.is_empty() {
            return Err(FormError::MissingAmount);
        }
        match amount.replace(',', ".").parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => {}
            _ => return Err(FormError::InvalidAmount(amount.to_string())),
        }

        Ok(Order {
            customer_name: customer_name.to_string(),
            product: self.product.trim().to_string(),
            back_text: self.back_text.trim().to_string(),
            payment_method: self.payment_method.trim().to_string(),
            currency: self.currency.trim().to_string(),
            amount: amount.to_string(),
            reference: self.reference.trim().to_string(),
            delivery_mode: self.delivery_mode.trim().to_string(),
            address: self.address.trim().to_string(),
            phone: self.phone.trim().to_string(),
        })
    }
}

/// A submitted order. Immutable; constructed only by [`OrderForm::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    customer_name: String,
    product: String,
    back_text: String,
    payment_method: String,
    currency: String,
    amount: String,
    reference: String,
    delivery_mode: String,
    address: String,
    phone: String,
}

impl Order {
    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }
    pub fn product(&self) -> &str {
        &self.product
    }
    pub fn back_text(&self) -> &str {
        &self.back_text
    }
    pub fn payment_method(&self) -> &str {
        &self.payment_method
    }
    pub fn currency(&self) -> &str {
        &self.currency
    }
    pub fn amount(&self) -> &str {
        &self.amount
    }
    pub fn reference(&self) -> &str {
        &self.reference
    }
    pub fn delivery_mode(&self) -> &str {
        &self.delivery_mode
    }
    pub fn address(&self) -> &str {
        &self.address
    }
    pub fn phone(&self) -> &str {
        &self.phone
    }

    /// Caption for the messaging sink, in Telegram legacy Markdown.
    ///
    /// Field order is fixed. Empty fields are shown as `-` so every caption
    /// has the same shape. User text is escaped, and when the caption would
    /// exceed [`CAPTION_LIMIT`] characters the longest values are shortened
    /// (ending in `…`) so every label survives intact.
    pub fn caption(&self) -> String {
        let raw = [
            self.customer_name.as_str(),
            self.product.as_str(),
            self.back_text.as_str(),
            self.payment_method.as_str(),
            self.amount.as_str(),
            self.currency.as_str(),
            self.reference.as_str(),
            self.delivery_mode.as_str(),
            self.address.as_str(),
            self.phone.as_str(),
        ];
        // One extra char for the space between amount and currency.
        let fixed = render_caption(&Default::default()).chars().count() + 1;
        let costs = raw.map(escaped_len);
        let caps = share_budget(&costs, CAPTION_LIMIT.saturating_sub(fixed));
        let mut values: [String; CAPTION_FIELDS] = Default::default();
        for (i, value) in raw.iter().enumerate() {
            values[i] = escape_within(value, caps[i]);
        }
        render_caption(&values)
    }

    /// One spreadsheet row:
    /// timestamp, customer, product, payment method, amount, currency,
    /// reference, delivery mode, phone.
    pub fn sheet_row(&self, at: DateTime<Utc>) -> Vec<String> {
        vec![
            at.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.customer_name.clone(),
            self.product.clone(),
            self.payment_method.clone(),
            self.amount.clone(),
            self.currency.clone(),
            self.reference.clone(),
            self.delivery_mode.clone(),
            self.phone.clone(),
        ]
    }

    /// File name offered for download, derived from the customer name.
    pub fn download_filename(&self) -> String {
        download_filename(&self.customer_name)
    }
}

static RE_NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// `ela_<slug>.png`, or [`FALLBACK_FILENAME`] when nothing usable remains.
pub fn download_filename(customer_name: &str) -> String {
    let lower = customer_name.to_lowercase();
    let slug = RE_NON_SLUG.replace_all(&lower, "_");
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        format!("ela_{slug}.png")
    }
}

/// Escape the characters Telegram's legacy Markdown treats as markup.
pub fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if is_markup(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

const CAPTION_FIELDS: usize = 10;

/// Lay out already-escaped values in caption order.
fn render_caption(v: &[String; CAPTION_FIELDS]) -> String {
    let payment = format!("{} {}", v[4], v[5]);
    [
        "💎 *New engraving order*".to_string(),
        format!("👤 *Customer:* {}", or_dash(&v[0])),
        format!("💍 *Product:* {}", or_dash(&v[1])),
        format!("✍️ *Back engraving:* {}", or_dash(&v[2])),
        format!("💳 *Payment method:* {}", or_dash(&v[3])),
        format!("💰 *Amount:* {}", payment.trim()),
        format!("🧾 *Reference:* {}", or_dash(&v[6])),
        format!("🚚 *Delivery:* {}", or_dash(&v[7])),
        format!("📍 *Address:* {}", or_dash(&v[8])),
        format!("📞 *Phone:* {}", or_dash(&v[9])),
    ]
    .join("\n")
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn is_markup(c: char) -> bool {
    matches!(c, '_' | '*' | '`' | '[')
}

fn escaped_len(s: &str) -> usize {
    s.chars().map(|c| if is_markup(c) { 2 } else { 1 }).sum()
}

/// Split `budget` across values so short ones stay whole and the longest
/// ones share what is left equally.
fn share_budget(costs: &[usize], budget: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..costs.len()).collect();
    order.sort_by_key(|&i| costs[i]);
    let mut caps = vec![0; costs.len()];
    let mut remaining = budget;
    for (k, &i) in order.iter().enumerate() {
        let share = remaining / (costs.len() - k);
        caps[i] = costs[i].min(share);
        remaining -= caps[i];
    }
    caps
}

/// Escape `value`, cutting it so the escaped form is at most `max` chars.
/// Escape pairs are never split; a cut value ends in `…`.
fn escape_within(value: &str, max: usize) -> String {
    if escaped_len(value) <= max {
        return escape_markdown(value);
    }
    let mut out = String::new();
    if max == 0 {
        return out;
    }
    let mut used = 0;
    for c in value.chars() {
        let cost = if is_markup(c) { 2 } else { 1 };
        if used + cost + 1 > max {
            break;
        }
        if is_markup(c) {
            out.push('\\');
        }
        out.push(c);
        used += cost;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn form() -> OrderForm {
        OrderForm {
            customer_name: "  Ana María ".into(),
            product: "Pendant".into(),
            back_text: "Te amo".into(),
            payment_method: "Transfer".into(),
            currency: "USD".into(),
            amount: "25,50".into(),
            reference: "REF_001".into(),
            delivery_mode: "Pickup".into(),
            address: String::new(),
            phone: "+1 555 0100".into(),
        }
    }

    #[test]
    fn validate_trims_and_freezes() {
        let order = form().validate().unwrap();
        assert_eq!(order.customer_name(), "Ana María");
        assert_eq!(order.amount(), "25,50");
        assert_eq!(order.address(), "");
    }

    #[test]
    fn validate_requires_name_and_amount() {
        let mut f = form();
        f.customer_name = "   ".into();
        assert_eq!(f.validate(), Err(FormError::MissingCustomerName));

        let mut f = form();
        f.amount = String::new();
        assert_eq!(f.validate(), Err(FormError::MissingAmount));

        let mut f = form();
        f.amount = "twenty".into();
        assert_eq!(f.validate(), Err(FormError::InvalidAmount("twenty".into())));

        let mut f = form();
        f.amount = "-3".into();
        assert!(f.validate().is_err());
    }

    #[test]
    fn caption_has_fixed_field_order() {
        let caption = form().validate().unwrap().caption();
        let labels = [
            "Customer", "Product", "Back engraving", "Payment method", "Amount", "Reference",
            "Delivery", "Address", "Phone",
        ];
        let mut last = 0;
        for label in labels {
            let pos = caption.find(label).unwrap_or_else(|| panic!("{label} missing"));
            assert!(pos > last, "{label} out of order");
            last = pos;
        }
        assert!(caption.contains("💰 *Amount:* 25,50 USD"));
        assert!(caption.contains("📍 *Address:* -"));
        assert!(caption.contains("REF\\_001"));
    }

    fn unescaped_stars(caption: &str) -> usize {
        let mut count = 0;
        let mut chars = caption.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '*' => count += 1,
                _ => {}
            }
        }
        count
    }

    #[test]
    fn caption_is_capped() {
        let mut f = form();
        f.back_text = "x".repeat(5000);
        let caption = f.validate().unwrap().caption();
        assert!(caption.chars().count() <= CAPTION_LIMIT);
        assert_eq!(unescaped_stars(&caption) % 2, 0);
        assert!(caption.contains("📞 *Phone:* +1 555 0100"));
        assert!(caption.contains("💰 *Amount:* 25,50 USD"));
        assert!(caption.contains("x…\n💳 *Payment method:* Transfer"));
    }

    #[test]
    fn long_back_text_just_over_the_limit_keeps_markup_balanced() {
        let mut f = form();
        f.back_text = "x".repeat(906);
        let caption = f.validate().unwrap().caption();
        assert!(caption.chars().count() <= CAPTION_LIMIT);
        assert_eq!(unescaped_stars(&caption) % 2, 0);
        assert!(caption.ends_with("📞 *Phone:* +1 555 0100"));
    }

    #[test]
    fn every_field_long_and_full_of_markup() {
        let noisy = "_*`[".repeat(200);
        let f = OrderForm {
            customer_name: noisy.clone(),
            product: noisy.clone(),
            back_text: noisy.clone(),
            payment_method: noisy.clone(),
            currency: noisy.clone(),
            amount: "1".repeat(300),
            reference: noisy.clone(),
            delivery_mode: noisy.clone(),
            address: noisy.clone(),
            phone: noisy,
        };
        let caption = f.validate().unwrap().caption();
        assert!(caption.chars().count() <= CAPTION_LIMIT);
        assert_eq!(unescaped_stars(&caption) % 2, 0);
        for label in ["*Customer:*", "*Back engraving:*", "*Amount:*", "*Phone:*"] {
            assert!(caption.contains(label), "{label} missing");
        }
    }

    #[test]
    fn short_values_are_never_cut() {
        assert_eq!(share_budget(&[3, 500, 10], 100), vec![3, 87, 10]);
        assert_eq!(escape_within("a_b", 3), "a…");
        assert_eq!(escape_within("a_b", 4), "a\\_b");
        assert_eq!(escape_within("abc", 0), "");
    }

    #[test]
    fn sheet_row_layout() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let row = form().validate().unwrap().sheet_row(at);
        assert_eq!(
            row,
            vec![
                "2026-03-14 09:26:53",
                "Ana María",
                "Pendant",
                "Transfer",
                "25,50",
                "USD",
                "REF_001",
                "Pickup",
                "+1 555 0100",
            ]
        );
    }

    #[test]
    fn download_filename_slugs_name() {
        assert_eq!(download_filename("Ana María"), "ela_ana_mar_a.png");
        assert_eq!(download_filename("  Bob  Smith! "), "ela_bob_smith.png");
        assert_eq!(download_filename("渡辺"), FALLBACK_FILENAME);
        assert_eq!(download_filename(""), FALLBACK_FILENAME);
    }

    #[test]
    fn escape_markdown_escapes_markup() {
        assert_eq!(escape_markdown("a_b*c`d[e]"), "a\\_b\\*c\\`d\\[e]");
    }
}
