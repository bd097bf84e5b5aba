use hyper::StatusCode;
use std::fmt::Debug;

#[derive(serde::Deserialize, Clone, Copy, PartialEq)]
pub(crate) struct Predict {
    pub unit_price: f64,
    pub quantity: i64,
    pub is_pro_customer: i64,
}

impl Debug for Predict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predict")
            .field("unit_price", &self.unit_price)
            .field("quantity", &self.quantity)
            .field("is_pro_customer", &self.is_pro_customer)
            .finish()
    }
}

impl Predict {
    /// Feature row in training column order.
    pub fn features(&self) -> [f64; 3] {
        [
            self.unit_price,
            self.quantity as f64,
            self.is_pro_customer as f64,
        ]
    }

    /// Parses `unit_price=..&quantity=..&is_pro_customer=..`, percent-decoding keys and values.
    pub fn from_query(query: &str) -> Result<Self, Error> {
        let params = url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| {
                // numbers come back as JSON numbers, anything else stays a string
                let value = serde_json::from_str::<serde_json::Number>(value.trim())
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|_| serde_json::Value::String(value.into_owned()));
                (key.into_owned(), value)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::from_value(serde_json::Value::Object(params)).map_err(Error::InvalidParams)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq)]
pub(crate) struct Prediction {
    pub bulk_discount_applied: i64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq)]
pub(crate) struct Home {
    pub message: String,
}

#[derive(Debug)]
pub(crate) enum Error {
    NotFound,
    MethodNotAllowed,
    WrongJson(serde_json::Error),
    InvalidParams(serde_json::Error),
    PayloadTooLarge(usize),
    Model(crate::error::ModelError),
}

#[derive(serde::Serialize)]
struct ErrorBody {
    status: u16,
    code: u16,
    message: String,
}

impl Error {
    #[inline]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::WrongJson(_) => StatusCode::BAD_REQUEST,
            Self::InvalidParams(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[inline]
    pub fn body(&self) -> serde_json::Value {
        macro_rules! error {
            ($code:expr, $msg:expr) => {
                ErrorBody {
                    status: self.status().as_u16(),
                    code: $code,
                    message: $msg.into(),
                }
            };
        }

        #[inline]
        fn json(v: impl serde::Serialize) -> serde_json::Value {
            serde_json::to_value(v).unwrap_or_default()
        }

        match self {
            Self::NotFound => json(error!(0, "Not Found")),
            Self::MethodNotAllowed => json(error!(0, "Method Not Allowed")),
            Self::WrongJson(e) => json(error!(1, e.to_string())),
            Self::InvalidParams(e) => json(error!(2, e.to_string())),
            Self::PayloadTooLarge(limit) => {
                json(error!(4, format!("request body exceeds {limit} bytes")))
            }
            Self::Model(e) => json(error!(3, e.to_string())),
        }
    }
}

#[test]
fn test_query_parsing() {
    let req = Predict::from_query("unit_price=120.5&quantity=12&is_pro_customer=1").unwrap();
    assert_eq!(
        req,
        Predict {
            unit_price: 120.5,
            quantity: 12,
            is_pro_customer: 1
        }
    );
    assert_eq!(req.features(), [120.5, 12.0, 1.0]);

    // integer prices are fine
    let req = Predict::from_query("is_pro_customer=0&unit_price=99&quantity=3").unwrap();
    assert_eq!(req.unit_price, 99.0);
}

#[test]
fn test_query_percent_decoding() {
    let req = Predict::from_query("unit_price=1%2E5&quantity=3&is_pro_customer=1").unwrap();
    assert_eq!(req.unit_price, 1.5);

    let req = Predict::from_query("unit_price=100&quantity=%31%35&is_pro_customer=1").unwrap();
    assert_eq!(req.quantity, 15);

    // encoded keys and `+` as space around a value
    let req = Predict::from_query("unit%5Fprice=+42+&quantity=2&is_pro_customer=0").unwrap();
    assert_eq!(req.features(), [42.0, 2.0, 0.0]);

    let err = Predict::from_query("unit_price=%41&quantity=2&is_pro_customer=1").unwrap_err();
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[test]
fn test_query_errors() {
    for query in [
        "",
        "unit_price=10&quantity=2",
        "unit_price=abc&quantity=2&is_pro_customer=1",
        "unit_price=10&quantity=2.5&is_pro_customer=1",
    ] {
        let err = Predict::from_query(query).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY, "{query}");
    }
}

#[test]
fn test_error_body() {
    let body = Error::NotFound.body();
    assert_eq!(body["status"], 404);
    assert_eq!(body["message"], "Not Found");

    let err = serde_json::from_str::<Predict>("{").unwrap_err();
    let body = Error::WrongJson(err).body();
    assert_eq!(body["status"], 400);
    assert_eq!(body["code"], 1);

    let body = Error::PayloadTooLarge(16).body();
    assert_eq!(body["status"], 413);
    assert_eq!(body["code"], 4);
}
